use std::sync::Arc;
use std::thread;

use engine_common::config::LoadBalancerConfig;
use engine_common::EngineError;
use engine_core::load_balancer::{P2cLoadBalancer, WorkerHealth};

fn balancer(seed: u64) -> P2cLoadBalancer {
    P2cLoadBalancer::new(LoadBalancerConfig { sample_size: 2, failure_threshold: 2, seed: Some(seed) }).unwrap()
}

#[test]
fn empty_pool_has_no_worker() {
    let lb = balancer(1);
    assert!(lb.is_empty());
    assert!(matches!(lb.select_worker(), Err(EngineError::NoWorkers)));
}

#[test]
fn idle_worker_is_picked_more_often() {
    let lb = balancer(42);
    for i in 0..10 {
        lb.add_worker(format!("w{i}"), None);
    }
    for i in 1..10 {
        lb.update_worker(&format!("w{i}"), 100, None);
    }
    let trials = 1000;
    let hits = (0..trials).filter(|_| lb.select_worker().unwrap() == "w0").count();
    // uniform choice would give ~100; sampling two gives ~200
    assert!(hits > 150, "idle worker picked {hits} times");
}

#[test]
fn latency_breaks_pending_ties() {
    let lb = balancer(3);
    lb.add_worker("fast", None);
    lb.add_worker("slow", None);
    lb.update_worker("fast", 0, Some(10.0));
    lb.update_worker("slow", 0, Some(50.0));
    for _ in 0..50 {
        assert_eq!(lb.select_worker().unwrap(), "fast");
    }
}

#[test]
fn failed_workers_are_skipped() {
    let lb = balancer(5);
    lb.add_worker("bad", None);
    lb.add_worker("good", None);
    lb.set_health("bad", WorkerHealth::Failed);
    for _ in 0..50 {
        assert_eq!(lb.select_worker().unwrap(), "good");
    }
    lb.set_health("good", WorkerHealth::Failed);
    // nothing healthy left: fall back to the whole pool
    assert!(lb.select_worker().is_ok());
}

#[test]
fn latency_is_an_exponential_average() {
    let lb = balancer(1);
    lb.add_worker("w", None);
    lb.update_worker("w", 1, Some(100.0));
    assert!((lb.worker("w").unwrap().avg_latency_ms - 10.0).abs() < 1e-9);
    lb.update_worker("w", 0, Some(100.0));
    assert!((lb.worker("w").unwrap().avg_latency_ms - 19.0).abs() < 1e-9);
    assert!(!lb.update_worker("missing", 1, None));
}

#[test]
fn pending_never_goes_negative() {
    let lb = balancer(1);
    lb.add_worker("w", None);
    lb.update_worker("w", 2, None);
    lb.update_worker("w", -5, None);
    let w = lb.worker("w").unwrap();
    assert_eq!(w.pending, 0);
    assert_eq!(w.total_requests, 2);
}

#[test]
fn health_follows_failures_and_recovery() {
    let lb = balancer(1);
    lb.add_worker("w", None);
    lb.record_failure("w");
    assert_eq!(lb.worker("w").unwrap().health, WorkerHealth::Degraded);
    lb.record_failure("w");
    assert_eq!(lb.worker("w").unwrap().health, WorkerHealth::Degraded);
    lb.record_failure("w");
    assert_eq!(lb.worker("w").unwrap().health, WorkerHealth::Failed);

    lb.record_success("w", 5.0);
    assert_eq!(lb.worker("w").unwrap().health, WorkerHealth::Recovering);
    assert_eq!(lb.worker("w").unwrap().consecutive_failures, 0);
    lb.record_success("w", 5.0);
    assert_eq!(lb.worker("w").unwrap().health, WorkerHealth::Healthy);
}

#[test]
fn locality_group_is_preferred() {
    let lb = balancer(9);
    lb.add_worker("a1", Some("rack-a"));
    lb.add_worker("b1", Some("rack-b"));
    lb.add_worker("b2", Some("rack-b"));
    for _ in 0..20 {
        assert_eq!(lb.select_worker_in_group("rack-a").unwrap(), "a1");
    }
    lb.set_health("a1", WorkerHealth::Failed);
    let picked = lb.select_worker_in_group("rack-a").unwrap();
    assert!(picked.starts_with('b'));
    assert!(lb.select_worker_in_group("nowhere").is_ok());
}

#[test]
fn concurrent_updates_are_not_lost() {
    let lb = Arc::new(balancer(1));
    lb.add_worker("w", None);
    thread::scope(|s| {
        for _ in 0..8 {
            let lb = lb.clone();
            s.spawn(move || {
                for _ in 0..1000 {
                    lb.update_worker("w", 1, None);
                    lb.select_worker().unwrap();
                }
            });
        }
    });
    assert_eq!(lb.worker("w").unwrap().pending, 8000);
}

#[test]
fn removed_worker_is_not_selected() {
    let lb = balancer(2);
    lb.add_worker("a", None);
    lb.add_worker("b", None);
    assert!(lb.remove_worker("a"));
    assert!(!lb.remove_worker("a"));
    assert_eq!(lb.len(), 1);
    assert_eq!(lb.snapshot()[0].id, "b");
    assert_eq!(lb.select_worker().unwrap(), "b");
}

#[test]
fn zero_sample_size_is_rejected() {
    let cfg = LoadBalancerConfig { sample_size: 0, ..LoadBalancerConfig::default() };
    assert!(P2cLoadBalancer::new(cfg).is_err());
}
