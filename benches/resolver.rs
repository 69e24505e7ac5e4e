use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use quota_sync::backend::GroupView;
use quota_sync::engine::{plan_quota_mutation, resolve_limit, BonusLedger};
use quota_sync::persistence::PersistenceConfig;
use quota_sync::types::{PermissionNode, QuotaPrefix, UserId};

fn make_groups(count: usize, nodes_per_group: usize) -> Vec<GroupView> {
    (0..count)
        .map(|g| {
            let mut nodes: Vec<PermissionNode> = (0..nodes_per_group)
                .map(|n| PermissionNode::granted(format!("plugin.perm.{}.{}", g, n)))
                .collect();
            nodes.push(PermissionNode::granted(format!("axplayerwarps.warps.{}", g)));
            GroupView::new(format!("group{}", g), nodes)
        })
        .collect()
}

/// Benchmark resolving the group limit over inherited closures
fn bench_resolve_limit(c: &mut Criterion) {
    let prefix = QuotaPrefix::default();

    let mut group = c.benchmark_group("resolve_limit");
    group.throughput(Throughput::Elements(1));

    for (groups, nodes) in [(4, 16), (16, 64), (64, 256)] {
        let inherited = make_groups(groups, nodes);
        let primary = inherited[0].clone();
        group.bench_function(format!("{}x{}", groups, nodes), |b| {
            b.iter(|| black_box(resolve_limit(&prefix, Some(&primary), &inherited)))
        });
    }

    group.finish();
}

/// Benchmark planning the node mutation for a user
fn bench_plan(c: &mut Criterion) {
    let prefix = QuotaPrefix::default();
    let mut nodes: Vec<PermissionNode> = (0..128)
        .map(|n| PermissionNode::granted(format!("plugin.perm.{}", n)))
        .collect();
    nodes.push(PermissionNode::granted("axplayerwarps.warps.5"));

    let mut group = c.benchmark_group("plan_quota_mutation");
    group.bench_function("noop", |b| {
        b.iter(|| black_box(plan_quota_mutation(&prefix, &nodes, 5)))
    });
    group.bench_function("replace", |b| {
        b.iter(|| black_box(plan_quota_mutation(&prefix, &nodes, 8)))
    });
    group.finish();
}

/// Benchmark ledger reads
fn bench_ledger_get(c: &mut Criterion) {
    let dir = std::env::temp_dir().join("quota-sync-bench-ledger");
    let _ = std::fs::remove_dir_all(&dir);
    let ledger = BonusLedger::open(&PersistenceConfig::new(&dir)).unwrap();

    let users: Vec<UserId> = (0..1000).map(|_| UserId::random()).collect();
    for (i, user) in users.iter().enumerate().step_by(10) {
        ledger.set(*user, i as i64 + 1).unwrap();
    }

    let mut group = c.benchmark_group("ledger");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_present", |b| {
        let user = users[500];
        b.iter(|| black_box(ledger.get(user)))
    });

    group.bench_function("get_absent", |b| {
        let user = users[501];
        b.iter(|| black_box(ledger.get(user)))
    });

    group.finish();
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(benches, bench_resolve_limit, bench_plan, bench_ledger_get);
criterion_main!(benches);
