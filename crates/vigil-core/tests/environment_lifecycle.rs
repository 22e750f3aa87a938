//! 环境与服务生命周期的集成测试。
//!
//! 数据流统一使用 [`MemoryConnector`]，时间统一使用 [`MockClock`]，
//! 每个测试都能逐拍断言记录顺序与统计。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use vigil_core::data_flow::DataFlowStatus;
use vigil_core::test_stubs::MemoryConnector;
use vigil_core::{
    DataFlowId, Environment, MockClock, MonitorRecord, OptionBlock, PoolSelector, Schedule,
    Service, ServiceState, ServiceType, TimerEvent, VigilError,
};

const MONITORING_ONLY: &str = "\
monitoring_data_flow_options
 data_flow_id 10001
 connect_port 20001
 nodelay 1
";

const WITH_NAME_SERVER: &str = "\
name_server_options
 data_flow_id 10000
 connect_port 20002
monitoring_data_flow_options
 data_flow_id 10001
 connect_port 20001
smartbeat_interval 100
";

const MONITORING: DataFlowId = DataFlowId::new(10001);
const NAME_SERVER: DataFlowId = DataFlowId::new(10000);

fn environment(text: &str, connector: &MemoryConnector) -> (MockClock, Environment) {
    let clock = MockClock::new();
    let options = OptionBlock::parse(text).unwrap();
    let env = Environment::builder()
        .clock(clock.clone())
        .connector(connector.clone())
        .build(&options)
        .unwrap();
    (clock, env)
}

fn tick(env: &Environment) -> usize {
    env.dispatch_timer_pools(PoolSelector::All).unwrap().fired
}

#[test]
fn running_service_reports_each_checkpoint() {
    let connector = MemoryConnector::new();
    let (clock, env) = environment(MONITORING_ONLY, &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    service.set_state(ServiceState::Running).unwrap();

    for checkpoint in 0..3 {
        service.update_checkpoint(checkpoint);
        env.dispatch_timer_pools(PoolSelector::All).unwrap();
        clock.advance(env.smartbeat_interval());
    }

    let beats = connector.smartbeats_for(MONITORING);
    assert_eq!(beats.len(), 3);
    for (expected, beat) in beats.iter().enumerate() {
        assert_eq!(beat.checkpoint, expected as u64);
        assert_eq!(beat.state, ServiceState::Running);
        assert_eq!(beat.service_name, "svc-A");
        assert_eq!(beat.service_id, 1);
    }
    assert!(beats.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    assert_eq!(env.stats().smartbeats_sent, 3);

    service.close();
    env.close().unwrap();
}

#[test]
fn lifecycle_notifications_follow_the_state_machine() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    service.set_state(ServiceState::Running).unwrap();
    service.close();

    let kinds: Vec<_> = connector
        .records_for(MONITORING)
        .iter()
        .map(|record| match record {
            MonitorRecord::ServiceStateChanged { from, to, .. } => format!("{from}->{to}"),
            other => other.kind().to_owned(),
        })
        .collect();
    assert_eq!(
        kinds,
        [
            "service_created",
            "created->running",
            "running->stopping",
            "stopping->closed",
            "service_destroyed",
        ]
    );
    assert_eq!(env.live_services(), 0);
}

#[test]
fn only_forward_transitions_are_accepted() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Control).unwrap();

    let err = service.set_state(ServiceState::Stopping).unwrap_err();
    assert!(matches!(
        err,
        VigilError::InvalidStateTransition {
            from: ServiceState::Created,
            to: ServiceState::Stopping,
            ..
        }
    ));
    assert_eq!(err.code(), "vigil.service.invalid_transition");
    assert_eq!(service.state(), ServiceState::Created);

    service.set_state(ServiceState::Running).unwrap();
    assert!(service.set_state(ServiceState::Running).is_err());
    assert!(service.set_state(ServiceState::Created).is_err());
    service.set_state(ServiceState::Stopping).unwrap();
    service.set_state(ServiceState::Closed).unwrap();
    assert!(service.set_state(ServiceState::Running).is_err());

    // a handle already in `Closed` closes without further transitions
    let before = connector.records_for(MONITORING).len();
    service.close();
    let after = connector.records_for(MONITORING);
    assert_eq!(after.len(), before + 1);
    assert_eq!(after.last().map(MonitorRecord::kind), Some("service_destroyed"));
}

#[test]
fn closing_a_created_service_goes_straight_to_closed() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = Arc::clone(&seen);
    let service = env
        .service("svc-B", 2, ServiceType::Io)
        .on_state_change(move |change| {
            hook_seen
                .lock()
                .push((change.service_name.to_owned(), change.from, change.to));
        })
        .register()
        .unwrap();
    service.close();
    assert_eq!(
        *seen.lock(),
        [("svc-B".to_owned(), ServiceState::Created, ServiceState::Closed)]
    );
}

#[test]
fn custom_state_names_travel_with_notifications() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    service.set_state_name(ServiceState::Running, "serving");
    assert_eq!(service.state_name(ServiceState::Running), "serving");
    assert_eq!(service.state_name(ServiceState::Stopping), "stopping");
    service.set_state(ServiceState::Running).unwrap();

    let names: Vec<_> = connector
        .records_for(MONITORING)
        .into_iter()
        .filter_map(|record| match record {
            MonitorRecord::ServiceStateChanged { state_name, .. } => Some(state_name),
            _ => None,
        })
        .collect();
    assert_eq!(names, ["serving"]);
    service.close();
}

#[test]
fn closed_services_stop_reporting() {
    let connector = MemoryConnector::new();
    let (clock, env) = environment(MONITORING_ONLY, &connector);
    let keep = env.create_service("keep", 1, ServiceType::Data).unwrap();
    let gone = env.create_service("gone", 2, ServiceType::Data).unwrap();
    assert_eq!(tick(&env), 2);

    gone.close();
    clock.advance(env.smartbeat_interval());
    assert_eq!(tick(&env), 1);
    clock.advance(env.smartbeat_interval());
    tick(&env);

    let names: Vec<_> = connector
        .smartbeats_for(MONITORING)
        .into_iter()
        .map(|beat| beat.service_name)
        .collect();
    assert_eq!(names, ["keep", "gone", "keep", "keep"]);
    keep.close();
}

#[test]
fn service_closed_through_set_state_is_skipped_at_fire_time() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    service.set_state(ServiceState::Running).unwrap();
    service.set_state(ServiceState::Stopping).unwrap();
    service.set_state(ServiceState::Closed).unwrap();
    assert!(service.has_smartbeat_timer());

    let report = env.dispatch_timer_pools(PoolSelector::All).unwrap();
    assert_eq!(report.fired, 1);
    assert!(connector.smartbeats_for(MONITORING).is_empty());
    let stats = env.stats();
    assert_eq!(stats.smartbeats_skipped, 1);
    assert_eq!(stats.smartbeats_sent, 0);
    assert!(!service.has_smartbeat_timer());
    service.close();
    env.close().unwrap();
}

#[test]
fn service_closed_by_an_earlier_callback_misses_the_tick() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let pool = env.create_timer_pool("app").unwrap();
    let slot: Arc<Mutex<Option<Service>>> = Arc::new(Mutex::new(None));
    let closer = Arc::clone(&slot);
    env.schedule_timer(pool, 0, Duration::ZERO, Schedule::Once, move |event| {
        if let TimerEvent::Expired { .. } = event
            && let Some(service) = closer.lock().take()
        {
            service.close();
        }
    })
    .unwrap();
    let keep = env.create_service("keep", 1, ServiceType::Data).unwrap();
    *slot.lock() = Some(env.create_service("gone", 2, ServiceType::Data).unwrap());

    // the callback was scheduled first, so it runs before both smartbeats
    let report = env.dispatch_timer_pools(PoolSelector::All).unwrap();
    assert_eq!(report.fired, 2);
    assert_eq!(report.skipped, 1);
    let names: Vec<_> = connector
        .smartbeats_for(MONITORING)
        .into_iter()
        .map(|beat| beat.service_name)
        .collect();
    assert_eq!(names, ["keep"]);
    assert_eq!(env.live_services(), 1);
    assert!(slot.lock().is_none());
    keep.close();
    env.close().unwrap();
}

#[test]
fn long_intervals_accept_default_service_options() {
    let connector = MemoryConnector::new();
    let text = format!("{MONITORING_ONLY}smartbeat_interval 2000\n");
    let (_clock, env) = environment(&text, &connector);
    assert_eq!(env.smartbeat_interval(), Duration::from_millis(2000));
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    assert!(matches!(
        connector.records_for(MONITORING).first(),
        Some(MonitorRecord::ServiceCreated {
            activity_timeout_ms: 2000,
            ..
        })
    ));
    service.close();
    env.close().unwrap();
}

#[test]
fn out_of_range_timer_delay_is_a_config_error() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let pool = env.create_timer_pool("app").unwrap();
    let err = env
        .schedule_timer(pool, 0, Duration::MAX, Schedule::Once, |_| {})
        .unwrap_err();
    assert!(matches!(err, VigilError::Config { .. }), "{err}");
    assert_eq!(env.pending_timers(PoolSelector::Pool(pool)).unwrap(), 0);
    env.close().unwrap();
}

#[test]
fn environment_close_requires_closed_services() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(WITH_NAME_SERVER, &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();

    let err = env.close().unwrap_err();
    assert!(matches!(err, VigilError::Lifecycle { .. }));
    assert_eq!(err.code(), "vigil.lifecycle.violation");
    assert!(!env.is_closed());
    assert!(connector.closed().is_empty());

    service.close();
    env.close().unwrap();
    env.close().unwrap();
    let mut closed = connector.closed();
    closed.sort();
    assert_eq!(closed, [NAME_SERVER, MONITORING]);
}

#[test]
fn registration_goes_to_the_name_server() {
    let connector = MemoryConnector::new();
    let (clock, env) = environment(WITH_NAME_SERVER, &connector);
    let service = env.create_service("svc-A", 9, ServiceType::Management).unwrap();
    assert!(matches!(
        connector.records_for(NAME_SERVER).as_slice(),
        [MonitorRecord::Registration {
            service_id: 9,
            service_type: ServiceType::Management,
            ..
        }]
    ));

    // the name server beat is due one interval after creation
    clock.advance(Duration::from_millis(100));
    tick(&env);
    assert_eq!(
        connector.records_for(NAME_SERVER).last().map(MonitorRecord::kind),
        Some("name_server_beat")
    );
    service.close();
}

#[test]
fn service_options_override_the_interval() {
    let connector = MemoryConnector::new();
    let (clock, env) = environment(WITH_NAME_SERVER, &connector);
    let block = OptionBlock::parse("smartbeat_interval 40\nactivity_timeout 200\nsvcgrp_name edge\n")
        .unwrap();
    let fast = env
        .service("fast", 3, ServiceType::Network)
        .options(&block)
        .unwrap()
        .register()
        .unwrap();
    assert_eq!(fast.smartbeat_interval(), Duration::from_millis(40));
    assert_eq!(fast.options().group.as_deref(), Some("edge"));

    for _ in 0..5 {
        tick(&env);
        clock.advance(Duration::from_millis(20));
    }
    // due at 0, 40 and 80 ms
    assert_eq!(connector.smartbeats_for(MONITORING).len(), 3);

    let too_short = OptionBlock::parse("activity_timeout 50\n").unwrap();
    assert!(matches!(
        env.service("slow", 4, ServiceType::Io)
            .options(&too_short)
            .and_then(|builder| builder.register()),
        Err(VigilError::Config { .. })
    ));
    assert_eq!(env.live_services(), 1);
    fast.close();
}

#[test]
fn broken_flow_is_reconnected_on_the_next_beat() {
    let connector = MemoryConnector::new();
    let (clock, env) = environment(MONITORING_ONLY, &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    connector.break_next_send(MONITORING);

    assert_eq!(tick(&env), 1);
    assert_eq!(env.stats().smartbeats_failed, 1);
    assert_eq!(
        env.monitoring_data_flow().map(|flow| flow.status),
        Some(DataFlowStatus::Broken)
    );

    connector.set_reconnect_refused(MONITORING, true);
    clock.advance(env.smartbeat_interval());
    tick(&env);
    assert_eq!(env.stats().smartbeats_failed, 2);

    connector.set_reconnect_refused(MONITORING, false);
    clock.advance(env.smartbeat_interval());
    tick(&env);
    let stats = env.stats();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.smartbeats_sent, 1);
    assert_eq!(connector.opened(), [MONITORING, MONITORING]);
    assert_eq!(connector.smartbeats_for(MONITORING).len(), 1);
    service.close();
}

#[test]
fn replaced_monitoring_flow_is_reaped_after_the_delay() {
    let connector = MemoryConnector::new();
    let clock = MockClock::new();
    let env = Environment::builder()
        .clock(clock.clone())
        .connector(connector.clone())
        .monitoring_reap_delay(Duration::from_secs(2))
        .build(&OptionBlock::parse(MONITORING_ONLY).unwrap())
        .unwrap();
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    tick(&env);

    let replacement = OptionBlock::parse("data_flow_id 10003\nconnect_port 20003\n").unwrap();
    let new_id = env.set_monitoring_data_flow(&replacement).unwrap();
    assert_eq!(new_id, DataFlowId::new(10003));
    assert_eq!(env.monitoring_data_flow().map(|flow| flow.id), Some(new_id));
    assert!(connector.closed().is_empty());

    clock.advance(env.smartbeat_interval());
    tick(&env);
    assert_eq!(connector.smartbeats_for(new_id).len(), 1);
    assert_eq!(connector.smartbeats_for(MONITORING).len(), 1);

    clock.advance(Duration::from_secs(2));
    tick(&env);
    assert_eq!(connector.closed(), [MONITORING]);
    service.close();
    env.close().unwrap();
    assert_eq!(connector.closed(), [MONITORING, new_id]);
}

#[test]
fn monitoring_flow_can_be_attached_later() {
    let connector = MemoryConnector::new();
    let (clock, env) = environment("inhibit_name_service 1\n", &connector);
    let service = env.create_service("svc-A", 1, ServiceType::Data).unwrap();
    assert!(!service.has_smartbeat_timer());
    assert_eq!(tick(&env), 0);

    let block = OptionBlock::parse(MONITORING_ONLY).unwrap();
    let flow = block.find_sub_option("monitoring_data_flow_options").unwrap();
    env.set_monitoring_data_flow(&flow).unwrap();
    flow.release();
    block.release().unwrap();
    assert!(service.has_smartbeat_timer());

    clock.advance(Duration::from_millis(1));
    assert_eq!(tick(&env), 1);
    assert_eq!(connector.smartbeats_for(MONITORING).len(), 1);
    service.close();
}

#[test]
fn unreachable_flows_fail_creation_and_close_what_was_opened() {
    let connector = MemoryConnector::new();
    connector.refuse_port(20001);
    let options = OptionBlock::parse(WITH_NAME_SERVER).unwrap();
    let err = Environment::create(&options, connector.clone()).unwrap_err();
    assert!(matches!(err, VigilError::Connect { .. }));
    assert!(err.is_retryable());
    assert_eq!(connector.opened(), [NAME_SERVER]);
    assert_eq!(connector.closed(), [NAME_SERVER]);
}

#[test]
fn malformed_text_is_a_parse_error() {
    let err = Environment::from_text("a 1\n   b 2\n", MemoryConnector::new()).unwrap_err();
    assert!(matches!(err, VigilError::Parse { line: 2, .. }));
    let err = Environment::from_text(
        "monitoring_data_flow_options\n connect_port 20001\n",
        MemoryConnector::new(),
    )
    .unwrap_err();
    assert!(matches!(err, VigilError::Config { .. }));
}

#[test]
fn application_timers_receive_expiry_and_cancellation() {
    let connector = MemoryConnector::new();
    let (clock, env) = environment(MONITORING_ONLY, &connector);
    let pool = env.create_timer_pool("app").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&events);
    let every = Schedule::Every(Duration::from_millis(10));
    let periodic = env
        .schedule_timer(pool, 1, Duration::from_millis(10), every, move |event| {
            sink.lock().push(event)
        })
        .unwrap();
    let sink = Arc::clone(&events);
    let once = env
        .schedule_timer(pool, 2, Duration::from_secs(5), Schedule::Once, move |event| {
            sink.lock().push(event)
        })
        .unwrap();

    clock.advance(Duration::from_millis(25));
    env.dispatch_timer_pools(PoolSelector::Pool(pool)).unwrap();
    assert!(env.cancel_timer(once));
    assert!(!env.cancel_timer(once));

    assert_eq!(
        *events.lock(),
        [
            TimerEvent::Expired {
                id: periodic,
                tag: 1,
                lateness: Duration::from_millis(15),
            },
            TimerEvent::Cancelled { id: once, tag: 2 },
        ]
    );

    events.lock().clear();
    env.free_timer_pool(pool, true).unwrap();
    assert_eq!(
        *events.lock(),
        [TimerEvent::Cancelled {
            id: periodic,
            tag: 1
        }]
    );
}

#[test]
fn smartbeat_pool_is_reserved() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let reserved = env.smartbeat_pool();
    assert!(matches!(
        env.schedule_timer(reserved, 0, Duration::ZERO, Schedule::Once, |_| {}),
        Err(VigilError::Lifecycle { .. })
    ));
    assert!(matches!(
        env.free_timer_pool(reserved, false),
        Err(VigilError::Lifecycle { .. })
    ));
}

#[test]
fn bounded_dispatch_spreads_work_across_ticks() {
    let connector = MemoryConnector::new();
    let (_clock, env) = environment(MONITORING_ONLY, &connector);
    let services: Vec<_> = (0..4)
        .map(|id| env.create_service(format!("svc-{id}"), id, ServiceType::Data).unwrap())
        .collect();

    let report = env
        .dispatch_timer_pools_bounded(PoolSelector::All, 3)
        .unwrap();
    assert_eq!(report.fired, 3);
    assert!(report.exhausted);
    let report = env
        .dispatch_timer_pools_bounded(PoolSelector::All, 3)
        .unwrap();
    assert_eq!(report.fired, 1);
    assert!(!report.exhausted);
    assert_eq!(env.next_timer_in(PoolSelector::All).unwrap(), Some(env.smartbeat_interval()));

    for service in services {
        service.close();
    }
}

#[test]
fn environments_are_independent() {
    let first = MemoryConnector::new();
    let second = MemoryConnector::new();
    let (_c1, env_a) = environment(MONITORING_ONLY, &first);
    let (_c2, env_b) = environment(MONITORING_ONLY, &second);
    let a = env_a.create_service("svc-A", 1, ServiceType::Data).unwrap();
    let b = env_b.create_service("svc-A", 1, ServiceType::Data).unwrap();

    tick(&env_a);
    assert_eq!(first.smartbeats_for(MONITORING).len(), 1);
    assert!(second.smartbeats_for(MONITORING).is_empty());
    a.close();
    env_a.close().unwrap();
    assert_eq!(env_b.live_services(), 1);
    b.close();
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

    /// 每个节拍上报的检查点等于节拍前最后一次写入的值。
    #[test]
    fn smartbeat_carries_the_last_checkpoint_before_the_tick(
        rounds in prop::collection::vec(prop::collection::vec(any::<u64>(), 0..4), 1..8)
    ) {
        let connector = MemoryConnector::new();
        let (clock, env) = environment(MONITORING_ONLY, &connector);
        let service = env.create_service("svc-P", 5, ServiceType::Data).unwrap();
        service.set_state(ServiceState::Running).unwrap();

        let mut expected = Vec::new();
        let mut current = 0u64;
        for updates in &rounds {
            for value in updates {
                service.update_checkpoint(*value);
                current = *value;
            }
            expected.push(current);
            env.dispatch_timer_pools(PoolSelector::All).unwrap();
            clock.advance(env.smartbeat_interval());
        }

        let observed: Vec<_> = connector
            .smartbeats_for(MONITORING)
            .into_iter()
            .map(|beat| beat.checkpoint)
            .collect();
        prop_assert_eq!(observed, expected);
        service.close();
    }
}
