//! PPO training driven through the scheduler against live units.
use simpool_agent::{PpoAgent, PpoConfig};
use simpool_core::engine::builtin_factory;
use simpool_core::{Controller, RewardFn};
use simpool_orchestrator::{Orchestrator, OrchestratorConfig, Scheduler, SchedulerConfig};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use test_log::test;

/// Reward preferring small actuation near the rest position.
fn centering_reward() -> RewardFn {
    Box::new(|state, action| {
        let pos: f32 = state.iter().map(|s| s * s).sum();
        let effort: f32 = action.iter().map(|a| a * a).sum();
        Ok((1.0 - 0.1 * pos - 0.01 * effort).into())
    })
}

#[test]
fn ppo_agent_completes_an_update_against_live_units() {
    let config = OrchestratorConfig::default()
        .num_envs(2)
        .num_units(1)
        .episode_limit(10_000);
    let orchestrator = Arc::new(Orchestrator::build(config, builtin_factory()).unwrap());
    orchestrator.initialize().unwrap();

    let ppo_config = PpoConfig::default()
        .state_dim(24)
        .action_dim(9)
        .hidden(vec![16])
        .rollout_len(64)
        .epochs(2)
        .seed(7);
    let agent = Arc::new(Mutex::new(PpoAgent::new(ppo_config, centering_reward())));
    let controller: Arc<Mutex<dyn Controller>> = agent.clone();

    let scheduler = Scheduler::start(
        orchestrator.clone(),
        controller,
        None,
        SchedulerConfig::default()
            .physics_rate(200.0)
            .render_rate(50.0)
            .explore_std(0.0),
    );

    // Two environments feed the rollout buffer; one update needs 64
    // transitions, well within the deadline at these rates.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if agent.lock().unwrap().updates() >= 1 || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    scheduler.stop_and_join();

    let agent = agent.lock().unwrap();
    assert!(agent.updates() >= 1, "no update within the deadline");
    assert!(agent.last_record().get_scalar("actor_loss").is_some());
    assert!(agent.last_record().get_scalar("critic_loss").is_some());
    assert_eq!(agent.reinits(), 0, "policy diverged during the run");
    orchestrator.terminate();
}
