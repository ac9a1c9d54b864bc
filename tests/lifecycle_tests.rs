use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use onoffd::backend::{MockGpioBackend, MockOp};
use onoffd::config::{PinConfig, PinStore};
use onoffd::error::AppError;
use onoffd::gpio::LineMode;
use onoffd::lifecycle::{GpioManager, LifecycleState, Role};
use onoffd::platform::HostPlatform;
use onoffd::shutdown::{ShutdownAction, run_button_loop};

struct FakePlatform {
    release: String,
    gpio_ids: Mutex<Option<String>>,
}

impl FakePlatform {
    fn new(release: &str, gpio_ids: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            release: release.to_string(),
            gpio_ids: Mutex::new(gpio_ids.map(str::to_string)),
        })
    }
}

impl HostPlatform for FakePlatform {
    fn kernel_release(&self) -> Result<String, AppError> {
        Ok(self.release.clone())
    }

    fn probe_gpio_ids(&self) -> Result<String, AppError> {
        self.gpio_ids
            .lock()
            .clone()
            .ok_or_else(|| AppError::Probe("sh: permission denied".into()))
    }
}

/// Blocks the chip base lookup until the test lets it finish.
struct GatedPlatform {
    entered: std_mpsc::Sender<()>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl HostPlatform for GatedPlatform {
    fn kernel_release(&self) -> Result<String, AppError> {
        Ok("6.1.0".to_string())
    }

    fn probe_gpio_ids(&self) -> Result<String, AppError> {
        let _ = self.entered.send(());
        self.release
            .lock()
            .recv()
            .map_err(|e| AppError::Probe(e.to_string()))?;
        Ok(GPIO_IDS_512.to_string())
    }
}

#[derive(Default)]
struct CountingShutdown {
    calls: AtomicUsize,
}

impl ShutdownAction for CountingShutdown {
    fn request_shutdown(&self) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const GPIO_IDS_512: &str = "export\ngpiochip512\nunexport\n";

fn pins(soft_shutdown: u32, shutdown_button: u32, boot_ok: u32) -> PinConfig {
    PinConfig {
        soft_shutdown,
        shutdown_button,
        boot_ok,
    }
}

fn manager_for(
    platform: Arc<FakePlatform>,
) -> (GpioManager<MockGpioBackend>, Arc<MockGpioBackend>) {
    let backend = Arc::new(MockGpioBackend::default());
    let manager = GpioManager::new(backend.clone(), platform);
    (manager, backend)
}

#[test]
fn old_kernel_binds_logical_pins_and_skips_unset_button() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", Some(GPIO_IDS_512)));

    let summary = manager.start(&pins(17, 0, 22)).unwrap();

    assert!(summary.failed.is_empty());
    assert_eq!(summary.line(Role::SoftShutdown), Some(17));
    assert_eq!(summary.line(Role::BootOk), Some(22));
    assert_eq!(summary.line(Role::ShutdownButton), None);
    assert_eq!(backend.exported_lines(), vec![17, 22]);
    assert_eq!(backend.mode(17), Some(LineMode::Output));
    assert_eq!(backend.mode(22), Some(LineMode::OutputHigh));
    assert_eq!(backend.value(22), Some(1));
    assert!(
        !backend
            .ops()
            .iter()
            .any(|op| matches!(op, MockOp::Watch { .. }))
    );
    assert_eq!(manager.state(), LifecycleState::Bound);
}

#[test]
fn new_kernel_offsets_pins_by_chip_base() {
    let (manager, backend) = manager_for(FakePlatform::new("6.1.0-rpi7-rpi-v8", Some(GPIO_IDS_512)));

    let summary = manager.start(&pins(17, 0, 22)).unwrap();

    assert_eq!(manager.prefix(), 512);
    assert_eq!(summary.line(Role::SoftShutdown), Some(529));
    assert_eq!(summary.line(Role::BootOk), Some(534));
    assert_eq!(backend.exported_lines(), vec![529, 534]);
}

#[test]
fn unset_pins_never_open_a_line() {
    let (manager, backend) = manager_for(FakePlatform::new("6.6.20", Some(GPIO_IDS_512)));

    let summary = manager.start(&pins(0, 0, 0)).unwrap();

    assert!(summary.bound.is_empty());
    assert!(backend.ops().is_empty());
    assert_eq!(manager.state(), LifecycleState::Bound);
}

#[test]
fn button_is_watched_after_binding() {
    let (manager, backend) = manager_for(FakePlatform::new("5.15.0", None));

    manager.start(&pins(17, 4, 22)).unwrap();

    assert_eq!(backend.mode(4), Some(LineMode::InputBothEdges));
    assert_eq!(backend.watcher_count(4), 1);
    let ops = backend.ops();
    let export = ops
        .iter()
        .position(|op| *op == MockOp::Export { line: 4, mode: LineMode::InputBothEdges })
        .unwrap();
    let watch = ops
        .iter()
        .position(|op| *op == MockOp::Watch { line: 4 })
        .unwrap();
    assert!(export < watch);
    assert_eq!(manager.state(), LifecycleState::Watching);
    assert!(
        manager
            .bound_lines()
            .iter()
            .any(|b| b.role == Role::ShutdownButton && b.watching)
    );
}

#[test]
fn stop_releases_everything_in_order_and_is_idempotent() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));

    manager.start(&pins(17, 4, 22)).unwrap();
    let before = backend.ops().len();

    manager.stop();

    assert!(backend.exported_lines().is_empty());
    assert_eq!(
        backend.ops()[before..],
        [
            MockOp::Unexport { line: 22 },
            MockOp::Unexport { line: 17 },
            MockOp::UnwatchAll { line: 4 },
            MockOp::Unexport { line: 4 },
        ]
    );
    assert_eq!(manager.state(), LifecycleState::Released);
    assert!(manager.bound_lines().is_empty());

    let after = backend.ops().len();
    manager.stop();
    assert_eq!(backend.ops().len(), after);
}

#[test]
fn stop_before_start_is_a_no_op() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));

    manager.stop();

    assert!(backend.ops().is_empty());
    assert_eq!(manager.state(), LifecycleState::Unconfigured);
}

#[test]
fn start_is_rejected_while_bound_but_allowed_after_stop() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));

    manager.start(&pins(17, 0, 0)).unwrap();
    assert!(matches!(
        manager.start(&pins(17, 0, 0)),
        Err(AppError::InvalidState(_))
    ));
    assert_eq!(backend.exported_lines(), vec![17]);

    manager.stop();
    manager.start(&pins(18, 0, 0)).unwrap();
    assert_eq!(backend.exported_lines(), vec![18]);
}

#[test]
fn one_failed_bind_does_not_block_other_roles() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    backend.fail_export(17);

    let summary = manager.start(&pins(17, 4, 22)).unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, Role::SoftShutdown);
    assert_eq!(backend.exported_lines(), vec![4, 22]);
    assert_eq!(manager.state(), LifecycleState::Watching);
    assert!(manager.reboot_notify().is_ok());
}

#[test]
fn pin_past_line_range_fails_only_its_role() {
    let (manager, backend) = manager_for(FakePlatform::new("6.1.0", Some(GPIO_IDS_512)));

    let summary = manager.start(&pins(u32::MAX, 4, 22)).unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert!(matches!(
        summary.failed[0],
        (Role::SoftShutdown, AppError::InvalidValue(_))
    ));
    assert_eq!(summary.line(Role::SoftShutdown), None);
    assert_eq!(backend.exported_lines(), vec![516, 534]);
    assert_eq!(manager.state(), LifecycleState::Watching);
    assert!(manager.reboot_notify().is_ok());
}

#[test]
fn failed_release_does_not_stop_the_others() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    manager.start(&pins(17, 4, 22)).unwrap();
    backend.fail_unexport(22);
    backend.fail_unexport(17);
    let before = backend.ops().len();

    manager.stop();

    assert_eq!(
        backend.ops()[before..],
        [MockOp::UnwatchAll { line: 4 }, MockOp::Unexport { line: 4 }]
    );
    assert_eq!(backend.watcher_count(4), 0);
    assert!(backend.exported_lines().is_empty());
    assert_eq!(manager.state(), LifecycleState::Released);
    assert!(manager.bound_lines().is_empty());

    manager.start(&pins(18, 0, 0)).unwrap();
    assert_eq!(backend.exported_lines(), vec![18]);
}

#[test]
fn manager_stays_usable_while_chip_lookup_blocks() {
    let (entered_tx, entered_rx) = std_mpsc::channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let platform = Arc::new(GatedPlatform {
        entered: entered_tx,
        release: Mutex::new(release_rx),
    });
    let backend = Arc::new(MockGpioBackend::default());
    let manager = Arc::new(GpioManager::new(backend.clone(), platform));

    let starting = Arc::clone(&manager);
    let handle = thread::spawn(move || starting.start(&pins(17, 4, 0)));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(manager.state(), LifecycleState::Starting);
    assert!(manager.bound_lines().is_empty());
    assert!(matches!(
        manager.start(&pins(17, 4, 0)),
        Err(AppError::InvalidState(_))
    ));
    manager.stop();
    assert_eq!(manager.state(), LifecycleState::Starting);
    assert!(backend.ops().is_empty());

    release_tx.send(()).unwrap();
    let summary = handle.join().unwrap().unwrap();

    assert_eq!(summary.line(Role::SoftShutdown), Some(529));
    assert_eq!(summary.line(Role::ShutdownButton), Some(516));
    assert_eq!(manager.prefix(), 512);
    assert_eq!(manager.state(), LifecycleState::Watching);
}

#[test]
fn failed_chip_lookup_keeps_previous_prefix() {
    let platform = FakePlatform::new("6.1.0", None);
    let (manager, backend) = manager_for(platform.clone());

    manager.start(&pins(17, 0, 0)).unwrap();
    assert_eq!(manager.prefix(), 0);
    assert_eq!(backend.exported_lines(), vec![17]);
    manager.stop();

    *platform.gpio_ids.lock() = Some(GPIO_IDS_512.to_string());
    manager.start(&pins(17, 0, 0)).unwrap();
    assert_eq!(backend.exported_lines(), vec![529]);
    manager.stop();

    *platform.gpio_ids.lock() = None;
    manager.start(&pins(17, 0, 0)).unwrap();
    assert_eq!(manager.prefix(), 512);
    assert_eq!(backend.exported_lines(), vec![529]);
}

#[test]
fn unknown_kernel_release_applies_no_offset() {
    let (manager, backend) = manager_for(FakePlatform::new("custom-build", Some(GPIO_IDS_512)));

    manager.start(&pins(17, 0, 0)).unwrap();

    assert_eq!(backend.exported_lines(), vec![17]);
}

#[test]
fn reboot_notify_raises_soft_shutdown_once() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    manager.start(&pins(17, 0, 0)).unwrap();

    manager.reboot_notify().unwrap();

    let writes: Vec<_> = backend
        .ops()
        .into_iter()
        .filter(|op| matches!(op, MockOp::Write { .. }))
        .collect();
    assert_eq!(writes.len(), 1);
    assert!(matches!(writes[0], MockOp::Write { line: 17, value: 1, .. }));
    assert_eq!(backend.value(17), Some(1));
}

#[tokio::test(start_paused = true)]
async fn shutdown_notify_holds_soft_shutdown_for_a_second() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    manager.start(&pins(17, 0, 0)).unwrap();

    let started = tokio::time::Instant::now();
    manager.shutdown_notify().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1000));

    let writes: Vec<_> = backend
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            MockOp::Write { line, value, at } => Some((line, value, at)),
            _ => None,
        })
        .collect();
    assert_eq!(writes.len(), 2);
    assert_eq!((writes[0].0, writes[0].1), (17, 1));
    assert_eq!((writes[1].0, writes[1].1), (17, 0));
    assert!(writes[1].2 - writes[0].2 >= Duration::from_millis(1000));
    assert_eq!(backend.value(17), Some(0));
}

#[tokio::test]
async fn notifications_without_soft_shutdown_do_nothing() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    manager.start(&pins(0, 4, 22)).unwrap();
    let before = backend.ops().len();

    manager.reboot_notify().unwrap();
    manager.shutdown_notify().await.unwrap();

    assert_eq!(backend.ops().len(), before);
}

#[tokio::test]
async fn every_button_edge_requests_one_shutdown() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    manager.start(&pins(17, 4, 22)).unwrap();
    let events = manager.take_events().unwrap();
    assert!(manager.take_events().is_none());

    backend.trigger_edge(4, 1).unwrap();
    backend.trigger_edge(4, 0).unwrap();
    backend.trigger_edge(4, 0).unwrap();

    drop(manager);
    drop(backend);

    let action = Arc::new(CountingShutdown::default());
    run_button_loop(events, action.clone()).await;
    assert_eq!(action.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn released_button_stops_forwarding_edges() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    manager.start(&pins(0, 4, 0)).unwrap();
    let mut events = manager.take_events().unwrap();

    backend.trigger_edge(4, 1).unwrap();
    manager.stop();
    assert!(backend.trigger_edge(4, 0).is_err());

    let first = events.recv().await.unwrap();
    assert_eq!(first.line, 4);
    assert!(events.try_recv().is_err());
}

#[test]
fn install_writes_default_pin_store_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pins.json");
    let (manager, _backend) = manager_for(FakePlatform::new("5.10.0", None));

    let mut store = PinStore::open(&path).unwrap();
    manager.install(&mut store).unwrap();
    assert!(path.exists());
    assert_eq!(PinStore::load_file(&path).unwrap().pin_config(), pins(0, 0, 0));

    let mut store = PinStore::load_file(&path).unwrap();
    store.set("boot_ok", Some("22".into()));
    store.save().unwrap();
    manager.install(&mut store).unwrap();
    assert_eq!(PinStore::load_file(&path).unwrap().pin_config().boot_ok, 22);
}

#[test]
fn uninstall_releases_lines() {
    let (manager, backend) = manager_for(FakePlatform::new("5.10.0", None));
    manager.start(&pins(17, 4, 22)).unwrap();

    manager.uninstall();

    assert!(backend.exported_lines().is_empty());
    assert_eq!(manager.state(), LifecycleState::Released);
}
