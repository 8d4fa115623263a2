#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bampipe_backend::sim::SimPlatform;
use bampipe_config::PipeTable;
use bampipe_manager::{BamManager, Callback, ManagerConfig};

/// Six pipes over all three instances:
/// 0 hsusb a2 out (private), 1 hsusb a2 in (system), 2 hsusb ipa out
/// (pipe memory), 3 hsusb ipa in (system), 4 hsic a2 in (off-chip, reset on
/// connect), 5 ssusb qdss in (pipe memory).
pub const TABLE: &str = r#"{
    "num_pipes": 16,
    "fifo_base_addr": 301989888,
    "ignore_core_reset_ack": true,
    "qdss_core": "ssusb",
    "pipes": [
        { "label": "hsusb-a2-out-0", "mem_type": "private", "bam": "hsusb",
          "peer": "a2", "dir": "local_to_peer", "pipe_num": 0,
          "src_phys_addr": 305397760, "src_pipe_index": 1,
          "dst_phys_addr": 305659904, "dst_pipe_index": 4,
          "data_fifo_offset": 0, "data_fifo_size": 3072,
          "desc_fifo_offset": 3072, "desc_fifo_size": 1024 },
        { "label": "hsusb-a2-in-0", "mem_type": "system", "bam": "ci13xxx_msm",
          "peer": "a2", "dir": "peer_to_local", "pipe_num": 0,
          "src_phys_addr": 305659904, "src_pipe_index": 5,
          "dst_phys_addr": 305397760, "dst_pipe_index": 0,
          "data_fifo_size": 4096, "desc_fifo_size": 512 },
        { "label": "hsusb-ipa-out-0", "mem_type": "pipe_mem", "bam": "hsusb",
          "peer": "ipa", "dir": "local_to_peer", "pipe_num": 0,
          "src_phys_addr": 305397760, "src_pipe_index": 2,
          "dst_phys_addr": 305659904,
          "data_fifo_offset": 4096, "data_fifo_size": 1024,
          "desc_fifo_offset": 5120, "desc_fifo_size": 256 },
        { "label": "hsusb-ipa-in-0", "mem_type": "system", "bam": "hsusb",
          "peer": "ipa", "dir": "peer_to_local", "pipe_num": 0,
          "src_phys_addr": 305659904,
          "dst_phys_addr": 305397760, "dst_pipe_index": 3,
          "data_fifo_size": 2048, "desc_fifo_size": 512 },
        { "label": "hsic-a2-in-0", "mem_type": "off_chip", "bam": "hsic",
          "peer": "a2", "dir": "peer_to_local", "pipe_num": 0,
          "src_phys_addr": 318767104, "src_pipe_index": 6,
          "dst_phys_addr": 319815680, "dst_pipe_index": 1,
          "data_fifo_offset": 8192, "data_fifo_size": 2048,
          "desc_fifo_offset": 10240, "desc_fifo_size": 512,
          "reset_on_connect": true },
        { "label": "ssusb-qdss-in-0", "mem_type": "pipe_mem", "bam": "ssusb",
          "peer": "qdss", "dir": "peer_to_local", "pipe_num": 0,
          "src_phys_addr": 4235264000,
          "dst_phys_addr": 4160749568, "dst_pipe_index": 2,
          "data_fifo_offset": 0, "data_fifo_size": 4096,
          "desc_fifo_offset": 4096, "desc_fifo_size": 512 }
    ]
}"#;

pub const HSUSB_A2_OUT: usize = 0;
pub const HSUSB_A2_IN: usize = 1;
pub const HSUSB_IPA_OUT: usize = 2;
pub const HSUSB_IPA_IN: usize = 3;
pub const HSIC_A2_IN: usize = 4;
pub const SSUSB_QDSS_IN: usize = 5;

pub fn table() -> PipeTable {
    PipeTable::from_json_str(TABLE).expect("test table should load")
}

pub fn start(sim: &Arc<SimPlatform>) -> BamManager {
    start_with(sim, ManagerConfig::default())
}

pub fn start_with(sim: &Arc<SimPlatform>, config: ManagerConfig) -> BamManager {
    BamManager::start(table(), sim.platform(), config).expect("manager should start")
}

/// A callback that counts its invocations.
pub fn counter() -> (Callback, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let hits = count.clone();
    let callback: Callback = Arc::new(move || {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    (callback, count)
}

pub fn hits(count: &AtomicUsize) -> usize {
    count.load(Ordering::SeqCst)
}

/// Poll `condition` until it holds, yielding to the manager's tasks.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
