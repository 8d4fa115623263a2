use std::sync::Arc;
use std::time::Duration;

use bampipe_backend::sim::SimPlatform;
use bampipe_manager::{BamManager, HandshakeState, HandshakeTransition, InstanceStatus};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::cmd::{load_table, runtime, start_simulated, SimulateArgs};
use crate::exit::{bam_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_json, table, tag, OutputFormat, SCHEMA_BASE};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct PipeResult {
    index: usize,
    label: String,
    connected: bool,
    local_pipe_index: Option<u32>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SimulateOutput {
    schema_id: String,
    pipes: Vec<PipeResult>,
    /// Instance counters with every pipe connected.
    connected: Vec<InstanceStatus>,
    /// Instance counters after the disconnect pass.
    disconnected: Vec<InstanceStatus>,
    counters_consistent: bool,
    handshake: Vec<HandshakeTransition>,
    operations: Vec<String>,
}

pub fn run(args: SimulateArgs, format: OutputFormat) -> CliResult<i32> {
    let pipes = load_table(&args.config)?;
    let output = runtime()?.block_on(async move {
        let (sim, manager) = start_simulated(pipes)?;
        let result = scenario(&sim, &manager, args.handshake).await;
        if let Err(err) = manager.shutdown().await {
            tracing::warn!(error = %err, "manager shutdown reported an error");
        }
        result
    })?;

    print_simulation(&output, format);
    let failed = output.pipes.iter().any(|pipe| !pipe.connected) || !output.counters_consistent;
    Ok(if failed { FAILURE } else { SUCCESS })
}

async fn scenario(
    sim: &Arc<SimPlatform>,
    manager: &BamManager,
    handshake: bool,
) -> CliResult<SimulateOutput> {
    let mut transitions = manager.subscribe_handshake();
    if handshake {
        sim.set_auto_ack(true);
        manager
            .register_peer_reset(Arc::new(|| tracing::info!("peer reset requested")))
            .map_err(|err| bam_error("failed to register peer reset", err))?;
        let watcher = manager.subscribe_handshake();
        manager.client_ready(true);
        wait_for_state(watcher, HandshakeState::PlugAcked).await?;
    }

    let mut results = Vec::with_capacity(manager.len());
    for status in manager.pipes() {
        let outcome = manager.connect(status.index);
        if let Err(err) = &outcome {
            tracing::error!(index = status.index, error = %err, "connect failed");
        }
        results.push(PipeResult {
            index: status.index,
            label: status.label,
            connected: outcome.is_ok(),
            local_pipe_index: outcome.as_ref().ok().copied(),
            error: outcome.err().map(|err| err.to_string()),
        });
    }
    let connected = manager.instances();

    for index in (0..manager.len()).rev() {
        manager
            .disconnect(index)
            .map_err(|err| bam_error(&format!("failed to disconnect pipe {index}"), err))?;
    }
    let disconnected = manager.instances();
    let counters_consistent = manager.counters_consistent();

    if handshake {
        let watcher = manager.subscribe_handshake();
        manager.client_ready(false);
        wait_for_state(watcher, HandshakeState::Init).await?;
    }

    let mut handshake_log = Vec::new();
    while let Ok(transition) = transitions.try_recv() {
        handshake_log.push(transition);
    }

    Ok(SimulateOutput {
        schema_id: format!("{SCHEMA_BASE}/simulation-report.schema.json"),
        pipes: results,
        connected,
        disconnected,
        counters_consistent,
        handshake: handshake_log,
        operations: sim.ops().iter().map(|op| format!("{op:?}")).collect(),
    })
}

/// Wait until `watcher` sees the handshake reach `target`. Subscribe before
/// triggering the change.
async fn wait_for_state(
    mut watcher: broadcast::Receiver<HandshakeTransition>,
    target: HandshakeState,
) -> CliResult<()> {
    let reached = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match watcher.recv().await {
                Ok(transition) if transition.to == target => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;

    match reached {
        Ok(true) => Ok(()),
        Ok(false) => Err(CliError::new(FAILURE, "handshake worker stopped")),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("handshake did not reach {target} within {HANDSHAKE_TIMEOUT:?}"),
        )),
    }
}

fn print_simulation(output: &SimulateOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => {
            let mut pipes = table(["#", "LABEL", "CONNECTED", "PIPE", "ERROR"]);
            for pipe in &output.pipes {
                pipes.add_row(vec![
                    pipe.index.to_string(),
                    pipe.label.clone(),
                    pipe.connected.to_string(),
                    pipe.local_pipe_index
                        .map_or_else(|| "-".to_string(), |index| index.to_string()),
                    pipe.error.clone().unwrap_or_default(),
                ]);
            }
            println!("{pipes}");

            let mut instances = table(["INSTANCE", "REGISTERED", "CONNECTED", "AFTER DISCONNECT"]);
            for (up, down) in output.connected.iter().zip(&output.disconnected) {
                instances.add_row(vec![
                    tag(&up.bam),
                    up.registered.to_string(),
                    up.enabled_pipes.to_string(),
                    down.enabled_pipes.to_string(),
                ]);
            }
            println!("{instances}");
            println!("{} backend operations", output.operations.len());
        }
        OutputFormat::Pretty => {
            for pipe in &output.pipes {
                match &pipe.error {
                    None => println!("  [{}] {} connected", pipe.index, pipe.label),
                    Some(err) => println!("  [{}] {} FAILED: {err}", pipe.index, pipe.label),
                }
            }
            for (up, down) in output.connected.iter().zip(&output.disconnected) {
                println!(
                    "  {}: {} enabled, {} after disconnect",
                    up.bam, up.enabled_pipes, down.enabled_pipes
                );
            }
            for transition in &output.handshake {
                println!("  handshake {} -> {}", transition.from, transition.to);
            }
            for op in &output.operations {
                println!("  op {op}");
            }
        }
    }
}
