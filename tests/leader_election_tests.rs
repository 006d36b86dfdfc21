// Leader election across many candidates sharing one lock file

use agent_hive::election::{read_leader_record, ElectionConfig, LeaderElection};
use futures::future::join_all;
use std::sync::Arc;
use tempfile::TempDir;

fn config(dir: &TempDir) -> ElectionConfig {
    ElectionConfig {
        lock_path: dir.path().join("hive").join("leader.lock"),
        heartbeat_interval_ms: 50,
        stale_threshold_ms: 200,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_concurrent_candidate_wins() {
    let dir = TempDir::new().unwrap();
    let candidates: Vec<Arc<LeaderElection>> = (0..8)
        .map(|n| Arc::new(LeaderElection::new(format!("candidate-{n}"), config(&dir)).unwrap()))
        .collect();

    let handles = candidates.iter().map(|candidate| {
        let candidate = Arc::clone(candidate);
        tokio::spawn(async move { candidate.run_election().await.unwrap() })
    });
    let outcomes = join_all(handles).await;
    let winners = outcomes.into_iter().filter(|won| *won.as_ref().unwrap()).count();
    assert_eq!(winners, 1);

    let leaders: Vec<&Arc<LeaderElection>> = candidates.iter().filter(|c| c.is_leader()).collect();
    assert_eq!(leaders.len(), 1);
    let leader_id = leaders[0].agent_id().to_string();

    let record = read_leader_record(&config(&dir).lock_path).unwrap().unwrap();
    assert_eq!(record.agent_id, leader_id);
    assert_eq!(record.pid, std::process::id());

    // every follower that got as far as reading the record agrees on the leader
    for candidate in candidates.iter().filter(|c| !c.is_leader()) {
        if let Some(observed) = candidate.get_leader() {
            assert_eq!(observed, leader_id);
        }
    }

    for candidate in &candidates {
        candidate.resign().await;
    }
}

#[tokio::test]
async fn test_leadership_passes_on_after_resignation() {
    let dir = TempDir::new().unwrap();
    let first = LeaderElection::new("first", config(&dir)).unwrap();
    let second = LeaderElection::new("second", config(&dir)).unwrap();

    assert!(first.run_election().await.unwrap());
    assert!(!second.run_election().await.unwrap());
    assert_eq!(second.get_leader().as_deref(), Some("first"));

    first.resign().await;
    assert!(!first.is_leader());
    assert!(read_leader_record(&config(&dir).lock_path).unwrap().is_none());

    assert!(second.run_election().await.unwrap());
    assert_eq!(second.get_leader().as_deref(), Some("second"));
    assert!(!first.run_election().await.unwrap());
    assert_eq!(first.get_leader().as_deref(), Some("second"));

    second.resign().await;
}

#[tokio::test]
async fn test_dropped_leader_releases_lock() {
    let dir = TempDir::new().unwrap();
    let successor = LeaderElection::new("successor", config(&dir)).unwrap();
    {
        let departing = LeaderElection::new("departing", config(&dir)).unwrap();
        assert!(departing.run_election().await.unwrap());
    }
    // let the aborted holder task drop its guard
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(successor.run_election().await.unwrap());
    let record = read_leader_record(&config(&dir).lock_path).unwrap().unwrap();
    assert_eq!(record.agent_id, "successor");

    successor.resign().await;
}
