//! End-to-end tests driving real units over the full command surface.
use simpool_core::engine::builtin_factory;
use simpool_core::{Controller, EnvState, SimPoolError};
use simpool_orchestrator::{Orchestrator, OrchestratorConfig, Scheduler, SchedulerConfig};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use test_log::test;

/// Controller producing all-zero actions, for deterministic stepping.
struct ZeroController;

impl Controller for ZeroController {
    fn action(&mut self, _env: &EnvState) -> Option<Vec<f32>> {
        Some(vec![0.0; 9])
    }
}

fn build_pool(num_envs: usize, num_units: usize) -> Arc<Orchestrator> {
    let config = OrchestratorConfig::default()
        .num_envs(num_envs)
        .num_units(num_units)
        .episode_limit(10_000);
    Arc::new(Orchestrator::build(config, builtin_factory()).unwrap())
}

#[test]
fn initialize_resolves_after_every_ack() {
    let orchestrator = build_pool(4, 2);
    orchestrator.initialize().unwrap();

    let ids = orchestrator.env_ids();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    for env_id in ids {
        let env = orchestrator.env_state(env_id).unwrap();
        assert_eq!(env.step_count, 0);
        assert!(!env.done);
    }
    orchestrator.terminate();
}

#[test]
fn initialize_rejects_when_a_unit_reports_an_error() {
    let config = OrchestratorConfig::default()
        .num_envs(2)
        .num_units(1)
        .env_type("no_such_model");
    let orchestrator = Orchestrator::build(config, builtin_factory()).unwrap();
    match orchestrator.initialize() {
        Err(SimPoolError::InitializationFailure { .. }) => {}
        other => panic!("unexpected: {:?}", other),
    }
    orchestrator.terminate();
}

#[test]
fn request_response_calls_round_trip() {
    let orchestrator = build_pool(4, 2);
    orchestrator.initialize().unwrap();

    let obs = orchestrator.query_observation(3).unwrap();
    assert_eq!(obs.qpos.len(), 9);

    // Non-zero force is recorded; a zero force reports inactive.
    assert!(orchestrator.apply_force(2, 1, [1.0, 0.0, 0.0], [0.0; 3]).unwrap());
    assert!(!orchestrator.apply_force(2, 1, [0.0; 3], [0.0; 3]).unwrap());

    let obs = orchestrator.reset(0).unwrap();
    assert_eq!(obs.time, 0.0);

    match orchestrator.env_state(99) {
        Err(SimPoolError::UnknownEnvironment(99)) => {}
        other => panic!("unexpected: {:?}", other),
    }
    orchestrator.terminate();
}

#[test]
fn consumption_tick_applies_buffered_results() {
    let orchestrator = build_pool(4, 2);
    orchestrator.initialize().unwrap();

    let updates = Arc::new(AtomicUsize::new(0));
    let updates_in_cb = updates.clone();
    let controller: Arc<Mutex<dyn Controller>> = Arc::new(Mutex::new(ZeroController));
    let scheduler = Scheduler::start(
        orchestrator.clone(),
        controller,
        Some(Box::new(move |env: &EnvState| {
            assert!(env.episode_reward.is_finite());
            updates_in_cb.fetch_add(1, Ordering::SeqCst);
        })),
        SchedulerConfig::default()
            .physics_rate(100.0)
            .render_rate(50.0),
    );

    // Wait until every environment was stepped at least once.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let all_touched = orchestrator
            .env_ids()
            .iter()
            .all(|id| orchestrator.env_state(*id).unwrap().step_count > 0);
        if all_touched || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    scheduler.stop_and_join();

    assert!(updates.load(Ordering::SeqCst) > 0);
    for env_id in orchestrator.env_ids() {
        let env = orchestrator.env_state(env_id).unwrap();
        assert!(env.step_count > 0, "environment {} never stepped", env_id);
        assert!(env.episode_reward.is_finite());
    }
    orchestrator.terminate();
}

#[test]
fn queued_action_is_consumed_exactly_once() {
    let orchestrator = build_pool(4, 2);
    orchestrator.initialize().unwrap();

    orchestrator.set_action(1, vec![0.5; 9]).unwrap();
    assert_eq!(orchestrator.take_queued_action(1), Some(vec![0.5; 9]));
    assert_eq!(orchestrator.take_queued_action(1), None);
    orchestrator.terminate();
}

#[test]
fn steps_then_reset_leave_fresh_bookkeeping() {
    // 4 environments across 2 units, zero-action steps, then reset.
    let orchestrator = build_pool(4, 2);
    orchestrator.initialize().unwrap();

    let controller: Arc<Mutex<dyn Controller>> = Arc::new(Mutex::new(ZeroController));
    let scheduler = Scheduler::start(
        orchestrator.clone(),
        controller,
        None,
        SchedulerConfig::default()
            .physics_rate(200.0)
            .render_rate(50.0)
            .explore_std(0.0),
    );

    // Let every environment take at least 10 steps.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let enough = orchestrator
            .env_ids()
            .iter()
            .all(|id| orchestrator.env_state(*id).unwrap().step_count >= 10);
        if enough || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    scheduler.stop_and_join();

    for env_id in orchestrator.env_ids() {
        assert!(orchestrator.env_state(env_id).unwrap().step_count >= 10);
        orchestrator.reset(env_id).unwrap();
        let env = orchestrator.env_state(env_id).unwrap();
        assert_eq!(env.step_count, 0);
        assert!(!env.done);
        assert_eq!(env.episode_reward, 0.0);
    }
    orchestrator.terminate();
}

#[test]
fn terminate_discards_in_flight_work() {
    let orchestrator = build_pool(4, 2);
    orchestrator.initialize().unwrap();
    for env_id in orchestrator.env_ids() {
        orchestrator.step_env(env_id, vec![0.0; 9]).unwrap();
    }
    orchestrator.terminate();

    // The pool is gone; further commands fail instead of hanging.
    match orchestrator.step_env(0, vec![0.0; 9]) {
        Err(_) => {}
        Ok(()) => panic!("step accepted after terminate"),
    }
}
