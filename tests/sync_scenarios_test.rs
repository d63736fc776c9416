//! Multi-device trials: start ordering, signal start index, failures and
//! cancellation.

use daq_stream::acquire::{Acquire, AcquireError, OutputSync};
use daq_stream::device::AnalogDevice;
use daq_stream::sim::{FaultKind, SimConfig, SimFaults, SimInput, SimMode, SimOutput};
use daq_stream::sync::{negotiate, SyncRequest};
use daq_stream::{
    DeviceError, Direction, ErrorFlags, Lifecycle, SignalDescriptor, SignalList, Status,
    StreamTiming, SyncError, SyncMode,
};
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn realistic() -> SimConfig {
    SimConfig::default().with_mode(SimMode::Realistic)
}

fn input(ident: &str, path: &str, config: SimConfig) -> Arc<AnalogDevice> {
    let device = Arc::new(AnalogDevice::new(ident, Box::new(SimInput::new(config))));
    device.open(path).unwrap();
    device
}

fn output(ident: &str, path: &str, config: SimConfig) -> Arc<AnalogDevice> {
    let device = Arc::new(AnalogDevice::new(ident, Box::new(SimOutput::new(config))));
    device.open(path).unwrap();
    device
}

fn continuous_input(rate: f64) -> SignalList {
    SignalList::input()
        .with_continuous(true)
        .with_signal(SignalDescriptor::new(0).with_sample_rate(rate))
}

fn stimulus(rate: f64, seconds: f64) -> SignalList {
    let n = (rate * seconds) as usize;
    let data = (0..n).map(|i| ((i as f32) * 0.05).sin()).collect();
    SignalList::output().with_signal(SignalDescriptor::new(0).with_sample_rate(rate).with_data(data))
}

#[test]
fn test_negotiate_orders_master_first() {
    let requests = vec![
        SyncRequest::new(0, Direction::Output)
            .with_start_source(1)
            .with_inherit_rate(true),
        SyncRequest::new(1, Direction::Input),
    ];
    let plan = negotiate(&requests).unwrap();
    assert_eq!(plan.pairs(), vec![(1, false), (0, true)]);
    assert_eq!(plan.master_of(0), Some(1));
    assert_eq!(plan.mode(), SyncMode::AiSync);
}

#[test]
#[serial]
fn test_dependent_output_records_signal_start_index() {
    let timing = StreamTiming::new(Duration::from_millis(200), Duration::from_millis(10));
    let mut acquire = Acquire::new(timing);
    let a = input("A", "sim/ai0", realistic());
    let b = output("B", "sim/ao0", realistic());
    acquire.add_input(Arc::clone(&a));
    acquire.add_output(Arc::clone(&b), OutputSync::triggered_by("A", true));

    let mut inputs = vec![continuous_input(1000.0)];
    let mut outputs = vec![stimulus(1000.0, 0.5)];
    assert_eq!(acquire.test_read(&mut inputs), 0);
    assert_eq!(acquire.test_write(&mut outputs), 0);

    let a_started = Instant::now();
    acquire.start_read(&mut inputs).unwrap();
    thread::sleep(Duration::from_millis(100));
    acquire.start_write(&mut outputs).unwrap();
    let elapsed_scans = (a_started.elapsed().as_secs_f64() * 1000.0) as u64;

    assert_eq!(acquire.sync_mode(), Some(SyncMode::AiSync));
    acquire.wait(Duration::from_secs(5)).unwrap();

    assert_eq!(b.status(), Status::Idle);
    assert_eq!(a.status(), Status::Running);

    let index = acquire.signal_index().unwrap();
    assert!(index >= 90, "A ran ~100 ms before B started, index {index}");
    assert!(index <= elapsed_scans);
    assert_eq!(b.index(), index as i64);

    let trace = inputs[0].get(0).unwrap().trace();
    assert_eq!(trace.signal_index(), Some(index));
    assert!(trace.len() as u64 >= index);

    acquire.stop().unwrap();
    acquire.reset().unwrap();
    assert_eq!(acquire.status(), Status::Idle);
    assert_eq!(b.index(), -1);
}

#[test]
#[serial]
fn test_host_stall_causes_sticky_underrun() {
    let timing = StreamTiming::new(Duration::from_millis(200), Duration::from_millis(20));
    let mut acquire = Acquire::new(timing);
    let ao = output(
        "ao",
        "sim/ao0",
        realistic()
            .with_fifo_size(64)
            .with_faults(SimFaults::stall(2, Duration::from_millis(200))),
    );
    acquire.add_output(Arc::clone(&ao), OutputSync::none());

    let mut outputs = vec![stimulus(1000.0, 1.0)];
    acquire.start_write(&mut outputs).unwrap();

    match acquire.wait(Duration::from_secs(5)) {
        Err(AcquireError::Failed { device, error }) => {
            assert_eq!(device, "ao");
            assert!(matches!(error, DeviceError::Underrun { .. }));
        }
        other => panic!("expected an underrun, got {other:?}"),
    }

    assert_eq!(ao.status(), Status::Underrun);
    assert_eq!(acquire.status(), Status::Underrun);
    for sig in outputs[0].iter() {
        assert!(sig.errors().flags().contains(ErrorFlags::OVERFLOW_UNDERRUN));
    }
    assert!(!acquire.is_fatal());

    acquire.reset().unwrap();
    assert_eq!(ao.status(), Status::Idle);
    assert_eq!(ao.lifecycle(), Lifecycle::Open);

    let mut again = stimulus(1000.0, 0.1);
    ao.prepare(&mut again).unwrap();
    assert_eq!(ao.lifecycle(), Lifecycle::Prepared);
}

#[test]
#[serial]
fn test_request_stop_releases_waiter_within_update_time() {
    let update = Duration::from_millis(20);
    let mut acquire = Acquire::new(StreamTiming::new(Duration::from_millis(200), update));
    let ao = output("ao", "sim/ao0", realistic());
    acquire.add_output(Arc::clone(&ao), OutputSync::none());

    let mut outputs = vec![stimulus(1000.0, 10.0)];
    acquire.start_write(&mut outputs).unwrap();

    let stop = acquire.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let requested = Instant::now();
        stop.request_stop();
        requested
    });

    let result = acquire.wait(Duration::from_secs(10));
    let returned = Instant::now();
    let requested = stopper.join().unwrap();

    assert!(matches!(result, Err(AcquireError::Interrupted { ref device }) if device == "ao"));
    let latency = returned.saturating_duration_since(requested);
    assert!(latency <= update + Duration::from_millis(50), "wait returned after {latency:?}");

    acquire.reset().unwrap();
    assert_eq!(ao.status(), Status::Idle);
}

#[test]
#[serial]
fn test_input_failure_during_short_output_fails_the_wait() {
    let mut acquire = Acquire::new(StreamTiming::new(
        Duration::from_millis(200),
        Duration::from_millis(10),
    ));
    let ai = input(
        "ai",
        "sim/ai0",
        realistic().with_faults(SimFaults::fail_after(3, FaultKind::ReadError)),
    );
    let ao = output("ao", "sim/ao0", realistic());
    acquire.add_input(Arc::clone(&ai));
    acquire.add_output(Arc::clone(&ao), OutputSync::none());

    let mut inputs = vec![continuous_input(1000.0)];
    let mut outputs = vec![stimulus(1000.0, 0.15)];
    acquire.start_read(&mut inputs).unwrap();
    acquire.start_write(&mut outputs).unwrap();
    assert_eq!(ao.status(), Status::Running, "output should play from the FIFO alone");

    match acquire.wait(Duration::from_secs(5)) {
        Err(AcquireError::Failed { device, error }) => {
            assert_eq!(device, "ai");
            assert!(matches!(error, DeviceError::ReadError { .. }));
        }
        other => panic!("expected the input failure, got {other:?}"),
    }
    assert_eq!(ai.status(), Status::UnknownError);
    assert!(inputs[0]
        .get(0)
        .unwrap()
        .errors()
        .flags()
        .contains(ErrorFlags::DEVICE_ERROR));

    acquire.reset().unwrap();
    assert_eq!(acquire.status(), Status::Idle);
}

#[test]
fn test_conflicting_rate_inheritance_is_rejected() {
    let mut acquire = Acquire::new(StreamTiming::new(
        Duration::from_millis(200),
        Duration::from_millis(10),
    ));
    acquire.add_input(input("ai", "sim/ai0", SimConfig::default()));
    acquire.add_output(
        output("ao0", "sim/ao0", SimConfig::default()),
        OutputSync::triggered_by("ai", true),
    );
    acquire.add_output(
        output("ao1", "sim/ao1", SimConfig::default()),
        OutputSync::triggered_by("ai", false),
    );

    let mut inputs = vec![continuous_input(1000.0)];
    acquire.start_read(&mut inputs).unwrap();

    let mut outputs = vec![stimulus(1000.0, 0.1), stimulus(1000.0, 0.1)];
    let err = acquire.start_write(&mut outputs).unwrap_err();
    assert!(matches!(
        err,
        AcquireError::Sync(SyncError::ConflictingRateInheritance { master: 0, .. })
    ));
    acquire.reset().unwrap();
}

#[test]
fn test_vanished_board_is_session_fatal() {
    let mut acquire = Acquire::new(StreamTiming::new(
        Duration::from_millis(100),
        Duration::from_millis(5),
    ));
    acquire.add_input(input(
        "ai",
        "sim/ai0",
        SimConfig::default().with_faults(SimFaults::fail_after(2, FaultKind::NoDevice)),
    ));

    let mut inputs = vec![SignalList::input()
        .with_duration(2.0)
        .with_signal(SignalDescriptor::new(0).with_sample_rate(10_000.0))];
    acquire.start_read(&mut inputs).unwrap();

    match acquire.wait(Duration::from_secs(5)) {
        Err(AcquireError::Failed { error, .. }) => assert!(error.is_session_fatal()),
        other => panic!("expected a fatal failure, got {other:?}"),
    }
    assert!(acquire.is_fatal());
    assert!(inputs[0]
        .get(0)
        .unwrap()
        .errors()
        .flags()
        .contains(ErrorFlags::NO_DEVICE));

    acquire.reset().unwrap();
    assert!(matches!(
        acquire.start_read(&mut inputs),
        Err(AcquireError::Fatal(_))
    ));
}
