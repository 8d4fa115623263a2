mod common;

use std::time::Duration;

use bampipe_backend::sim::{SimOp, SimPlatform};
use bampipe_backend::{BamType, PipeOptions};
use bampipe_manager::{
    AcceleratorConnect, BamError, BamManager, EventKind, TimerUpdate, TIMER_USAGE,
};

use common::*;

fn timer_configs(sim: &SimPlatform, timeout_ms: u32) -> usize {
    sim.ops()
        .iter()
        .filter(|op| matches!(op, SimOp::ConfigureTimer { timeout_ms: ms, .. } if *ms == timeout_ms))
        .count()
}

#[tokio::test]
async fn inactivity_then_activity_cycle() {
    let sim = SimPlatform::new();
    let manager = start(&sim);
    manager.set_inactivity_timer(BamType::Hsusb, 100);

    let (activity, activity_hits) = counter();
    let (inactivity, inactivity_hits) = counter();
    manager
        .connect_accelerator(AcceleratorConnect {
            index: HSUSB_IPA_IN,
            client: 1,
            activity: Some(activity),
            inactivity: Some(inactivity),
        })
        .await
        .unwrap();
    let pipe = manager.lookup(HSUSB_IPA_IN).unwrap().handle.unwrap();
    assert_eq!(timer_configs(&sim, 100), 1);

    sim.fire_timer(BamType::Hsusb).unwrap();
    wait_until("inactivity callback", || hits(&inactivity_hits) == 1).await;
    assert!(manager.is_inactive(BamType::Hsusb));
    assert!(sim.wake_registered(pipe));
    assert_eq!(
        manager.lookup(HSUSB_IPA_IN).unwrap().wake,
        EventKind::WakeupGlobal
    );
    assert_eq!(
        sim.pipe_options(pipe),
        Some(PipeOptions {
            auto_enable: true,
            wakeup: true,
            wakeup_oneshot: true,
            ..PipeOptions::default()
        })
    );
    assert_eq!(hits(&activity_hits), 0);

    sim.fire_wake(HSUSB_IPA_IN).unwrap();
    wait_until("activity callback", || hits(&activity_hits) == 1).await;
    wait_until("timer re-armed", || timer_configs(&sim, 100) == 2).await;
    assert!(!manager.is_inactive(BamType::Hsusb));

    sim.fire_wake(HSUSB_IPA_IN).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits(&activity_hits), 1);
    assert_eq!(timer_configs(&sim, 100), 2);
    assert_eq!(hits(&inactivity_hits), 1);
}

#[tokio::test]
async fn back_to_back_wakes_clear_inactivity_once_per_cycle() {
    let sim = SimPlatform::new();
    let manager = start(&sim);
    manager.set_inactivity_timer(BamType::Hsusb, 100);

    let (activity, activity_hits) = counter();
    let (inactivity, inactivity_hits) = counter();
    manager
        .connect_accelerator(AcceleratorConnect {
            index: HSUSB_IPA_IN,
            client: 1,
            activity: Some(activity.clone()),
            inactivity: Some(inactivity),
        })
        .await
        .unwrap();
    manager
        .connect_accelerator(AcceleratorConnect {
            index: HSUSB_A2_IN,
            client: 2,
            activity: Some(activity),
            inactivity: None,
        })
        .await
        .unwrap();

    for cycle in 1..=3 {
        sim.fire_timer(BamType::Hsusb).unwrap();
        wait_until("inactivity callback", || hits(&inactivity_hits) == cycle).await;
        assert!(manager.is_inactive(BamType::Hsusb));

        sim.fire_wake(HSUSB_IPA_IN).unwrap();
        sim.fire_wake(HSUSB_IPA_IN).unwrap();
        sim.fire_wake(HSUSB_A2_IN).unwrap();
        wait_until("activity callback", || hits(&activity_hits) == cycle).await;
        wait_until("timer re-armed", || timer_configs(&sim, 100) == cycle + 1).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits(&activity_hits), cycle);
        assert!(!manager.is_inactive(BamType::Hsusb));
    }
    assert_eq!(timer_configs(&sim, 100), 4);
}

async fn with_inbound(sim: &std::sync::Arc<SimPlatform>) -> BamManager {
    let manager = start(sim);
    manager.connect(HSUSB_A2_IN).unwrap();
    manager
}

#[tokio::test]
async fn timer_without_callbacks_still_marks_inactive() {
    let sim = SimPlatform::new();
    let manager = start(&sim);

    sim.fire_timer(BamType::Hsic).unwrap();
    wait_until("instance inactive", || manager.is_inactive(BamType::Hsic)).await;
    assert!(!manager.is_inactive(BamType::Hsusb));
}

#[tokio::test]
async fn per_pipe_wake_always_dispatches() {
    let sim = SimPlatform::new();
    let manager = with_inbound(&sim).await;
    let (wake, wake_hits) = counter();

    manager.register_wake(HSUSB_A2_IN, Some(wake)).unwrap();
    assert_eq!(
        manager.lookup(HSUSB_A2_IN).unwrap().wake,
        EventKind::WakeupPipe
    );

    sim.fire_wake(HSUSB_A2_IN).unwrap();
    wait_until("first wake", || hits(&wake_hits) == 1).await;
    sim.fire_wake(HSUSB_A2_IN).unwrap();
    wait_until("second wake", || hits(&wake_hits) == 2).await;
    assert_eq!(timer_configs(&sim, 0), 0);
    assert!(!manager.is_inactive(BamType::Hsusb));
}

#[tokio::test]
async fn wake_registration_can_be_removed() {
    let sim = SimPlatform::new();
    let manager = with_inbound(&sim).await;
    let pipe = manager.lookup(HSUSB_A2_IN).unwrap().handle.unwrap();
    let (wake, _) = counter();

    manager.register_wake(HSUSB_A2_IN, Some(wake)).unwrap();
    assert!(sim.wake_registered(pipe));

    manager.register_wake(HSUSB_A2_IN, None).unwrap();
    assert!(!sim.wake_registered(pipe));
    assert_eq!(sim.pipe_options(pipe), Some(PipeOptions::auto_enable()));
    assert!(sim.fire_wake(HSUSB_A2_IN).is_err());
}

#[tokio::test]
async fn wake_needs_a_connected_pipe() {
    let sim = SimPlatform::new();
    let manager = start(&sim);
    let (wake, _) = counter();
    assert!(matches!(
        manager.register_wake(HSUSB_A2_IN, Some(wake)),
        Err(BamError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn timer_change_rearms_busy_instance() {
    let sim = SimPlatform::new();
    let manager = with_inbound(&sim).await;
    let pipe = manager.lookup(HSUSB_A2_IN).unwrap().handle.unwrap();
    sim.clear_ops();

    manager.set_inactivity_timer(BamType::Hsusb, 250);
    assert!(sim.ops().contains(&SimOp::ConfigureTimer {
        pipe,
        timeout_ms: 250,
    }));
    assert!(sim.ops().contains(&SimOp::ResetTimer(pipe)));

    sim.clear_ops();
    manager.set_inactivity_timer(BamType::Hsic, 250);
    assert_eq!(sim.op_count(), 0);
    assert_eq!(manager.inactivity_timer(BamType::Hsic), 250);
}

#[tokio::test]
async fn timer_control_surface() {
    let sim = SimPlatform::new();
    let manager = start(&sim);

    assert_eq!(
        manager.show_inactivity_timers(),
        "ssusb: 0ms\nhsusb: 0ms\nhsic: 0ms\n"
    );

    let update = manager
        .store_inactivity_timers("hsusb 100,hsic 40\n")
        .unwrap();
    assert_eq!(
        update,
        TimerUpdate::Applied(vec![(BamType::Hsusb, 100), (BamType::Hsic, 40)])
    );
    assert_eq!(
        manager.show_inactivity_timers(),
        "ssusb: 0ms\nhsusb: 100ms\nhsic: 40ms\n"
    );

    assert_eq!(
        manager.store_inactivity_timers("help").unwrap(),
        TimerUpdate::Usage(TIMER_USAGE)
    );

    assert!(matches!(
        manager.store_inactivity_timers("hsusb 5,ufs 1"),
        Err(BamError::UnknownInstance(_))
    ));
    assert!(matches!(
        manager.store_inactivity_timers("hsusb 5,hsic soon"),
        Err(BamError::InvalidArgument(_))
    ));
    assert_eq!(manager.inactivity_timer(BamType::Hsusb), 100);
    assert_eq!(manager.inactivity_timer(BamType::Hsic), 40);
}
