//! Abort paths: cleanup always runs, boot target never moves

mod fixtures;

use ab_flash_updater::lock::SessionLock;
use ab_flash_updater::session::{Outcome, SessionSummary};
use ab_flash_updater::slot::SlotId;
use ab_flash_updater::{CancelToken, ExitCode, FailureKind, Severity, SessionState};
use fixtures::{image, Harness, DEVICE_ID, SLOT_SIZE};

// === Capacity ===

#[test]
fn test_image_too_large_leaves_slot_untouched() {
    let h = Harness::new(SlotId::A);
    h.write_signed_bundle(DEVICE_ID, "1.2.0", &image(SLOT_SIZE + 1, 3));

    let report = h.orchestrator().run();

    assert_eq!(report.exit_code(), ExitCode::Failure);
    assert_eq!(report.failure_kind(), Some(FailureKind::FirmwareTooLarge));
    assert!(h.slot_untouched(SlotId::B));
    assert_eq!(h.env_value("active_slot").as_deref(), Some("A"));
    assert_eq!(h.leftover_work_areas(), 0);
}

#[test]
fn test_image_exactly_slot_size() {
    let h = Harness::new(SlotId::A);
    let firmware = image(SLOT_SIZE, 3);
    h.write_signed_bundle(DEVICE_ID, "1.2.0", &firmware);

    let report = h.orchestrator().run();

    assert_eq!(report.exit_code(), ExitCode::Success);
    assert_eq!(h.slot_bytes(SlotId::B), firmware);
}

#[test]
fn test_configured_capacity_limits_image() {
    let mut h = Harness::new(SlotId::A);
    h.config.slots.b.capacity = Some(1024);
    h.write_signed_bundle(DEVICE_ID, "1.2.0", &image(2048, 3));

    let report = h.orchestrator().run();

    assert_eq!(report.failure_kind(), Some(FailureKind::FirmwareTooLarge));
    assert!(h.slot_untouched(SlotId::B));
}

// === Session lock ===

#[test]
fn test_second_session_is_busy() {
    let h = Harness::new(SlotId::A);
    h.write_signed_bundle(DEVICE_ID, "1.2.0", &image(4096, 3));
    let _held = SessionLock::acquire(&h.config.state.lock_file).unwrap();

    let report = h.orchestrator().run();

    assert_eq!(report.exit_code(), ExitCode::Failure);
    assert_eq!(report.failure_kind(), Some(FailureKind::SessionBusy));
    assert!(h.slot_untouched(SlotId::B));
    assert_eq!(h.env_value("active_slot").as_deref(), Some("A"));
    // The holder owns the summary.
    assert!(!h.config.state.summary_file.exists());
}

#[test]
fn test_lock_released_after_session() {
    let h = Harness::new(SlotId::A);
    h.orchestrator().run();
    SessionLock::acquire(&h.config.state.lock_file).unwrap();
}

// === Cancellation ===

#[test]
fn test_cancelled_session_cleans_up() {
    let h = Harness::new(SlotId::A);
    h.write_signed_bundle(DEVICE_ID, "1.2.0", &image(4096, 3));
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = h.orchestrator().with_cancel(cancel).run();

    assert_eq!(report.exit_code(), ExitCode::Failure);
    assert_eq!(report.failure_kind(), Some(FailureKind::Cancelled));
    assert_eq!(report.state, SessionState::Aborted(FailureKind::Cancelled));
    assert!(h.slot_untouched(SlotId::B));
    assert_eq!(h.leftover_work_areas(), 0);

    let summary = SessionSummary::from_file(&h.config.state.summary_file).unwrap();
    assert_eq!(summary.outcome, Outcome::Aborted);
    assert_eq!(summary.failure_kind, Some(FailureKind::Cancelled));
}

// === Boot environment ===

#[test]
fn test_boot_env_unavailable_is_critical() {
    let h = Harness::new(SlotId::A);
    let firmware = image(8192, 3);
    h.write_signed_bundle(DEVICE_ID, "1.2.0", &firmware);
    h.env.set_unavailable(true);

    let report = h.orchestrator().run();

    let kind = report.failure_kind().unwrap();
    assert_eq!(kind, FailureKind::BootEnvUnavailable);
    assert_eq!(kind.severity(), Severity::Critical);
    assert_eq!(report.exit_code(), ExitCode::Failure);
    assert_eq!(report.state, SessionState::Aborted(FailureKind::BootEnvUnavailable));

    // Image is on B and verified, but nothing points at it.
    assert_eq!(&h.slot_bytes(SlotId::B)[..firmware.len()], &firmware[..]);
    h.env.set_unavailable(false);
    assert_eq!(h.env_value("active_slot").as_deref(), Some("A"));
    assert_eq!(h.installed_version().as_deref(), Some("1.0.0"));
    assert_eq!(h.reboot.count(), 0);
}

// === Summary ===

#[test]
fn test_unwritable_summary_is_only_a_warning() {
    let mut h = Harness::new(SlotId::A);
    // A directory where the summary file should go
    let blocked = h.temp.path().join("blocked");
    std::fs::create_dir_all(blocked.join("last_session.tmp")).unwrap();
    h.config.state.summary_file = blocked.join("last_session.json");
    h.write_signed_bundle(DEVICE_ID, "1.2.0", &image(4096, 3));

    let report = h.orchestrator().run();

    assert_eq!(report.exit_code(), ExitCode::Success);
    assert!(report.warnings.contains(&FailureKind::CleanupFailure));
}
