use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sitegate_zero_trust::{
    behavior_analysis::Activity, trust_store::BehavioralProfile, trust_store::TrustConfig,
    AccessCore, AccessGuardConfig, AccessRequest, AttemptMeta, BehavioralAnalyzer,
    CircuitBreakerError, InMemoryMfaRegistry, Location, ZeroTrustContext, ZeroTrustPolicy,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn core() -> AccessCore {
    AccessCore::new(
        AccessGuardConfig::default(),
        Arc::new(InMemoryMfaRegistry::new()),
    )
    .unwrap()
}

fn bench_validation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let core = core();
    let policy = ZeroTrustPolicy {
        allowed_locations: ["ID".to_string(), "SG".to_string()].into_iter().collect(),
        max_concurrent_sessions: 1,
        ..ZeroTrustPolicy::default()
    };

    let mut user = 0u64;
    c.bench_function("access_validate", |b| {
        b.iter(|| {
            user += 1;
            let user_id = format!("user-{user}");
            let request = AccessRequest {
                user_id: user_id.clone(),
                resource_id: "project/tower-b".to_string(),
                action: "read".to_string(),
                context: ZeroTrustContext {
                    user_id,
                    device_id: None,
                    ip_address: "36.72.14.9".to_string(),
                    user_agent: "Mozilla/5.0 Chrome/120.0".to_string(),
                    location: Some(Location::country("ID")),
                    session_id: "s1".to_string(),
                    timestamp: Utc::now(),
                },
            };
            rt.block_on(async { black_box(core.validator().validate(&request, &policy).await) })
        });
    });
}

fn bench_behavior_scoring(c: &mut Criterion) {
    let analyzer = BehavioralAnalyzer::default();
    let profile = BehavioralProfile::seeded("alice", &TrustConfig::default(), Utc::now());
    let activity = Activity {
        ip: "36.72.14.9".to_string(),
        user_agent: "python-requests/2.31".to_string(),
        timestamp: Utc::now(),
        location: Some(Location::country("BR")),
        resource: None,
        action: None,
    };

    c.bench_function("behavior_score", |b| {
        b.iter(|| black_box(analyzer.assess(black_box(&profile), black_box(&activity))))
    });
}

fn bench_lockout(c: &mut Criterion) {
    let core = core();
    let lockout = core.lockout();

    c.bench_function("lockout_record_and_check", |b| {
        b.iter(|| {
            lockout
                .record_attempt("pm@site.example", true, AttemptMeta::default())
                .unwrap();
            black_box(lockout.check_lockout("pm@site.example").unwrap())
        })
    });
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let core = core();
    let breaker = core.circuit_breaker();

    c.bench_function("circuit_execute_closed", |b| {
        b.iter(|| {
            rt.block_on(async {
                let result: Result<u32, CircuitBreakerError<&str>> =
                    breaker.execute("geo", || async { Ok(1) }).await;
                black_box(result)
            })
        })
    });
}

criterion_group!(
    benches,
    bench_validation,
    bench_behavior_scoring,
    bench_lockout,
    bench_circuit_breaker
);
criterion_main!(benches);
