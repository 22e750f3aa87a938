//! 定时引擎的追赶、排序与取消语义。
//!
//! 全部以 [`MockClock`] 逐拍推进，断言不依赖真实时间流逝。

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use vigil_core::time::{Clock, MockClock};
use vigil_core::timer::{Disposition, PoolSelector, Schedule, TimerEngine};

const PERIOD: Duration = Duration::from_millis(100);

fn engine<A>() -> (MockClock, TimerEngine<A>, vigil_core::PoolId) {
    let clock = MockClock::new();
    let engine = TimerEngine::new(Arc::new(clock.clone()));
    let pool = engine.create_pool("catch-up").unwrap();
    (clock, engine, pool)
}

fn tick<A>(engine: &TimerEngine<A>) -> usize {
    engine
        .dispatch(PoolSelector::All, None, |_| Disposition::Keep)
        .unwrap()
        .fired
}

#[test]
fn missed_periods_collapse_into_one_firing() {
    let (clock, engine, pool) = engine::<()>();
    engine
        .schedule(pool, 0, PERIOD, Schedule::Every(PERIOD), ())
        .unwrap();

    clock.advance(PERIOD * 3 + PERIOD / 2);
    let tick_at = clock.now();
    assert_eq!(tick(&engine), 1);
    assert_eq!(tick(&engine), 0, "the same tick never fires an entry twice");

    // rescheduled from the actual tick, not from the missed schedule
    assert_eq!(engine.next_due_in(PoolSelector::All).unwrap(), Some(PERIOD));
    clock.advance(PERIOD - Duration::from_millis(1));
    assert_eq!(tick(&engine), 0);
    clock.advance(Duration::from_millis(1));
    assert_eq!(clock.now(), tick_at + PERIOD);
    assert_eq!(tick(&engine), 1);
}

#[test]
fn five_missed_unit_periods_fire_once() {
    let unit = Duration::from_millis(1);
    let (clock, engine, pool) = engine::<()>();
    engine
        .schedule(pool, 0, unit, Schedule::Every(unit), ())
        .unwrap();
    clock.advance(unit * 5);
    assert_eq!(tick(&engine), 1);
    assert_eq!(engine.next_due_in(PoolSelector::All).unwrap(), Some(unit));
}

#[test]
fn lateness_reports_the_missed_interval() {
    let (clock, engine, pool) = engine::<()>();
    engine
        .schedule(pool, 0, PERIOD, Schedule::Every(PERIOD), ())
        .unwrap();
    clock.advance(PERIOD * 2);

    let mut lateness = Vec::new();
    engine
        .dispatch(PoolSelector::All, None, |firing| {
            lateness.push(firing.lateness());
            Disposition::Keep
        })
        .unwrap();
    assert_eq!(lateness, [PERIOD]);
}

#[test]
fn drop_disposition_retires_a_periodic_entry() {
    let (clock, engine, pool) = engine::<u32>();
    let id = engine
        .schedule(pool, 0, Duration::ZERO, Schedule::Every(PERIOD), 0)
        .unwrap();
    let report = engine
        .dispatch(PoolSelector::All, None, |firing| {
            *firing.action += 1;
            Disposition::Drop
        })
        .unwrap();
    assert_eq!(report.fired, 1);
    assert!(!engine.contains(id));
    clock.advance(PERIOD);
    assert_eq!(tick(&engine), 0);
}

#[test]
fn cancelling_an_entry_mid_tick_skips_it() {
    let (_clock, engine, pool) = engine::<&'static str>();
    engine
        .schedule(pool, 0, Duration::ZERO, Schedule::Every(PERIOD), "first")
        .unwrap();
    let second = engine
        .schedule(pool, 0, Duration::ZERO, Schedule::Every(PERIOD), "second")
        .unwrap();

    let mut fired = Vec::new();
    let report = engine
        .dispatch(PoolSelector::All, None, |firing| {
            fired.push(*firing.action);
            // the second entry is already taken out of the pool for this tick
            assert!(engine.cancel(second).is_none());
            Disposition::Keep
        })
        .unwrap();
    assert_eq!(fired, ["first"]);
    assert_eq!(report.skipped, 1);
    assert!(!engine.contains(second));
    assert_eq!(engine.pending(PoolSelector::All).unwrap(), 1);
}

#[test]
fn cancelling_the_firing_entry_stops_its_rescheduling() {
    let (clock, engine, pool) = engine::<()>();
    let id = engine
        .schedule(pool, 0, Duration::ZERO, Schedule::Every(PERIOD), ())
        .unwrap();
    let report = engine
        .dispatch(PoolSelector::All, None, |firing| {
            assert!(engine.cancel(firing.id).is_none());
            Disposition::Keep
        })
        .unwrap();
    assert_eq!(report.fired, 1);
    assert!(!engine.contains(id));
    clock.advance(PERIOD * 2);
    assert_eq!(tick(&engine), 0);
}

#[test]
fn entries_scheduled_during_a_tick_wait_for_the_next_one() {
    let (_clock, engine, pool) = engine::<u8>();
    engine
        .schedule(pool, 0, Duration::ZERO, Schedule::Once, 0)
        .unwrap();
    let report = engine
        .dispatch(PoolSelector::All, None, |_| {
            engine
                .schedule(pool, 1, Duration::ZERO, Schedule::Once, 1)
                .unwrap();
            Disposition::Keep
        })
        .unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(engine.pending(PoolSelector::All).unwrap(), 1);
    assert_eq!(tick(&engine), 1);
}

#[test]
fn selecting_one_pool_leaves_the_others_untouched() {
    let (_clock, engine, first) = engine::<()>();
    let second = engine.create_pool("second").unwrap();
    engine
        .schedule(first, 0, Duration::ZERO, Schedule::Once, ())
        .unwrap();
    engine
        .schedule(second, 0, Duration::ZERO, Schedule::Once, ())
        .unwrap();
    let report = engine
        .dispatch(PoolSelector::Pool(second), None, |firing| {
            assert_eq!(firing.pool, second);
            Disposition::Keep
        })
        .unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(engine.pending(PoolSelector::Pool(first)).unwrap(), 1);
}

#[test]
fn due_entries_interleave_across_pools() {
    let (clock, engine, first) = engine::<&'static str>();
    let second = engine.create_pool("second").unwrap();
    engine
        .schedule(second, 0, Duration::ZERO, Schedule::Once, "second-early")
        .unwrap();
    engine
        .schedule(first, 0, PERIOD, Schedule::Once, "first-late")
        .unwrap();
    engine
        .schedule(first, 0, Duration::ZERO, Schedule::Once, "first-early")
        .unwrap();
    clock.advance(PERIOD);

    let mut fired = Vec::new();
    let report = engine
        .dispatch(PoolSelector::All, Some(2), |firing| {
            fired.push(*firing.action);
            Disposition::Keep
        })
        .unwrap();
    assert_eq!(fired, ["second-early", "first-early"]);
    assert!(report.exhausted);
    assert_eq!(engine.pending(PoolSelector::Pool(first)).unwrap(), 1);
}

#[test]
fn removed_pool_returns_pending_entries_in_due_order() {
    let (_clock, engine, pool) = engine::<&'static str>();
    engine
        .schedule(pool, 0, PERIOD * 2, Schedule::Once, "late")
        .unwrap();
    engine
        .schedule(pool, 0, PERIOD, Schedule::Once, "early")
        .unwrap();
    let detached: Vec<_> = engine
        .remove_pool(pool)
        .unwrap()
        .into_iter()
        .map(|timer| timer.action)
        .collect();
    assert_eq!(detached, ["early", "late"]);
    assert!(engine.dispatch(PoolSelector::Pool(pool), None, |_| Disposition::Keep).is_err());
}

proptest! {
    /// 任意到期时刻组合下，触发顺序等于按 `(延迟, 插入序号)` 的稳定排序。
    #[test]
    fn firing_order_is_due_time_then_insertion(delays in prop::collection::vec(0u64..8, 1..24)) {
        let (clock, engine, pool) = engine::<usize>();
        for (index, delay) in delays.iter().enumerate() {
            engine
                .schedule(pool, 0, Duration::from_millis(*delay), Schedule::Once, index)
                .unwrap();
        }
        clock.advance(Duration::from_millis(8));

        let mut fired = Vec::new();
        engine
            .dispatch(PoolSelector::All, None, |firing| {
                fired.push(*firing.action);
                Disposition::Keep
            })
            .unwrap();

        let mut expected: Vec<usize> = (0..delays.len()).collect();
        expected.sort_by_key(|index| delays[*index]);
        prop_assert_eq!(fired, expected);
    }

    /// 无论错过多少个周期，一次节拍只触发一次，且下一次到期恰为一个周期之后。
    #[test]
    fn catch_up_never_bursts(missed in 1u32..50, extra_ms in 0u64..100) {
        let (clock, engine, pool) = engine::<()>();
        engine
            .schedule(pool, 0, PERIOD, Schedule::Every(PERIOD), ())
            .unwrap();
        clock.advance(PERIOD * missed + Duration::from_millis(extra_ms));
        prop_assert_eq!(tick(&engine), 1);
        prop_assert_eq!(engine.next_due_in(PoolSelector::All).unwrap(), Some(PERIOD));
    }
}
