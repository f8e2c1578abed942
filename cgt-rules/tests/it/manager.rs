use cgt_common::{channel, CgroupEvent};
use cgt_route::{Family, ManagedRoute, ManagedRule};
use cgt_rules::{Config, Error, Rule, RuleManager, RuleTarget, State, TProxy, Target};

use crate::fakes::{FakeClassifier, FakeNetlink, Op};

/// Table 100, one tproxy with mark 1, one rule `/user.slice/.* -> redirect(mark=1)`.
fn config() -> Config {
    Config {
        cgroup_root: "/sys/fs/cgroup".into(),
        route_table: 100,
        tproxies: vec![TProxy { name: "proxy".into(), mark: 1, port: 7893, no_udp: false }],
        rules: vec![Rule {
            pattern: "/user.slice/.*".into(),
            target: RuleTarget::Tproxy("proxy".into()),
        }],
        bypass: vec![],
    }
}

fn route(family: Family) -> ManagedRoute {
    ManagedRoute { family, table: 100, oif: 1 }
}

fn rule(family: Family, mark: u32) -> ManagedRule {
    ManagedRule { family, mark, table: 100 }
}

/// Runs a manager over `events` with the given fakes. The stream is closed after the last event.
async fn run_with(
    config: &Config,
    classifier: FakeClassifier,
    netlink: FakeNetlink,
    events: Vec<CgroupEvent>,
) -> (RuleManager<FakeClassifier, FakeNetlink>, Result<(), Error>) {
    let _ = tracing_subscriber::fmt::try_init();

    let (tx, rx) = channel(events.len().max(1));
    for event in events {
        tx.send(event).await.unwrap();
    }
    drop(tx);

    let span = tracing::info_span!("rule_manager");
    let mut manager = RuleManager::new(config, classifier, netlink, rx, span).unwrap();
    let res = manager.run().await;

    (manager, res)
}

#[tokio::test]
async fn matching_cgroup_is_redirected() {
    let (manager, res) = run_with(
        &config(),
        FakeClassifier::default(),
        FakeNetlink::default(),
        vec![CgroupEvent::created("/user.slice/app.slice/foo.service")],
    )
    .await;

    res.unwrap();

    let netlink = manager.router().netlink();
    assert_eq!(netlink.routes_added(), [route(Family::V4), route(Family::V6)]);
    assert_eq!(
        &netlink.ops[2..4],
        [Op::AddRule(rule(Family::V4, 1)), Op::AddRule(rule(Family::V6, 1))]
    );

    let classifier = manager.classifier();
    assert_eq!(
        classifier.ops,
        [
            Op::Init(1),
            Op::AddCgroup("/user.slice/app.slice/foo.service".into(), Target::Redirect { mark: 1 }),
            Op::Clear,
        ]
    );
}

#[tokio::test]
async fn unmatched_cgroup_never_reaches_the_classifier() {
    let (manager, res) = run_with(
        &config(),
        FakeClassifier::default(),
        FakeNetlink::default(),
        vec![CgroupEvent::created("/system.slice/other.service")],
    )
    .await;

    res.unwrap();
    assert_eq!(manager.classifier().ops, [Op::Init(1), Op::Clear]);
}

#[tokio::test]
async fn removal_is_forwarded_unconditionally() {
    let (manager, res) = run_with(
        &config(),
        FakeClassifier::default(),
        FakeNetlink::default(),
        vec![CgroupEvent::removed("/user.slice/app.slice/foo.service")],
    )
    .await;

    res.unwrap();
    assert_eq!(
        manager.classifier().ops,
        [Op::Init(1), Op::RemoveCgroup("/user.slice/app.slice/foo.service".into()), Op::Clear]
    );
}

#[tokio::test]
async fn failed_ipv6_route_rolls_back_ipv4_only() {
    let netlink = FakeNetlink { fail_route_add_after: Some(1), ..Default::default() };
    let (manager, res) = run_with(
        &config(),
        FakeClassifier::default(),
        netlink,
        vec![CgroupEvent::created("/user.slice/a.service")],
    )
    .await;

    let err = res.unwrap_err();
    assert!(matches!(err, Error::Route(_)), "unexpected error: {err}");

    let netlink = manager.router().netlink();
    assert_eq!(netlink.routes_added(), [route(Family::V4)]);
    assert_eq!(netlink.routes_removed(), [route(Family::V4)]);
    assert!(netlink.rules_removed().is_empty());

    // Classification was never reached, so it is neither initialized nor cleared.
    assert!(manager.classifier().ops.is_empty());
    assert_eq!(manager.state(), State::Stopped);
}

#[tokio::test]
async fn closed_stream_still_tears_everything_down() {
    let (manager, res) =
        run_with(&config(), FakeClassifier::default(), FakeNetlink::default(), vec![]).await;

    res.unwrap();
    assert_eq!(manager.state(), State::Stopped);

    let netlink = manager.router().netlink();
    let teardown: Vec<_> = netlink.ops[4..].to_vec();
    assert_eq!(
        teardown,
        [
            Op::DelRule(rule(Family::V4, 1)),
            Op::DelRule(rule(Family::V6, 1)),
            Op::DelRoute(route(Family::V4)),
            Op::DelRoute(route(Family::V6)),
        ]
    );
    assert_eq!(manager.classifier().ops, [Op::Init(1), Op::Clear]);
    assert!(manager.router().routes().is_empty());
    assert!(manager.router().rules().is_empty());
}

#[tokio::test]
async fn classifier_failure_clears_and_unwinds() {
    let mut config = config();
    config.tproxies.push(TProxy { name: "second".into(), mark: 2, port: 7894, no_udp: true });

    let classifier = FakeClassifier { fail_init_for: Some(2), ..Default::default() };
    let (manager, res) = run_with(&config, classifier, FakeNetlink::default(), vec![]).await;

    let err = res.unwrap_err();
    assert!(matches!(&err, Error::Classifier { name, .. } if name == "second"));

    assert_eq!(manager.classifier().ops, [Op::Init(1), Op::Clear]);

    let netlink = manager.router().netlink();
    assert_eq!(netlink.rules_removed(), [rule(Family::V4, 1), rule(Family::V6, 1)]);
    assert_eq!(netlink.routes_removed(), [route(Family::V4), route(Family::V6)]);
}

#[tokio::test]
async fn mark_rule_failure_clears_classification() {
    let netlink = FakeNetlink { fail_rule_add: true, ..Default::default() };
    let (manager, res) = run_with(&config(), FakeClassifier::default(), netlink, vec![]).await;

    assert!(matches!(res, Err(Error::Rule { .. })));
    assert_eq!(manager.classifier().ops, [Op::Init(1), Op::Clear]);
    assert_eq!(manager.router().netlink().routes_removed().len(), 2);
}

#[tokio::test]
async fn pre_existing_rules_are_adopted_and_removed() {
    let netlink =
        FakeNetlink { rules: vec![rule(Family::V4, 1), rule(Family::V6, 1)], ..Default::default() };
    let (manager, res) = run_with(&config(), FakeClassifier::default(), netlink, vec![]).await;

    res.unwrap();
    let netlink = manager.router().netlink();
    assert_eq!(netlink.rules_removed(), [rule(Family::V4, 1), rule(Family::V6, 1)]);
    assert!(netlink.rules.is_empty());
}

#[tokio::test]
async fn failing_cgroup_does_not_stop_the_loop() {
    let classifier =
        FakeClassifier { fail_add_for: Some("/user.slice/bad.service".into()), ..Default::default() };
    let (manager, res) = run_with(
        &config(),
        classifier,
        FakeNetlink::default(),
        vec![
            CgroupEvent::created("/user.slice/bad.service"),
            CgroupEvent::created("/user.slice/good.service"),
            CgroupEvent::removed("/user.slice/good.service"),
        ],
    )
    .await;

    res.unwrap();
    assert_eq!(
        manager.classifier().ops,
        [
            Op::Init(1),
            Op::AddCgroup("/user.slice/bad.service".into(), Target::Redirect { mark: 1 }),
            Op::AddCgroup("/user.slice/good.service".into(), Target::Redirect { mark: 1 }),
            Op::RemoveCgroup("/user.slice/good.service".into()),
            Op::Clear,
        ]
    );
}

#[tokio::test]
async fn teardown_failures_are_not_returned() {
    let classifier = FakeClassifier { fail_clear: true, ..Default::default() };
    let netlink = FakeNetlink { fail_removals: true, ..Default::default() };
    let (manager, res) = run_with(&config(), classifier, netlink, vec![]).await;

    res.unwrap();

    // Every tracked entry is attempted even though each removal fails.
    let netlink = manager.router().netlink();
    assert_eq!(netlink.rules_removed().len(), 2);
    assert_eq!(netlink.routes_removed().len(), 2);
}

#[tokio::test]
async fn setup_error_survives_failing_teardown() {
    let classifier = FakeClassifier { fail_init_for: Some(1), fail_clear: true, ..Default::default() };
    let netlink = FakeNetlink { fail_removals: true, ..Default::default() };
    let (manager, res) = run_with(&config(), classifier, netlink, vec![]).await;

    let err = res.unwrap_err();
    assert!(matches!(&err, Error::Classifier { name, .. } if name == "proxy"));

    // The cause is reachable through `source` only, not repeated in the message.
    assert_eq!(err.to_string(), "failed to initialize classification for tproxy `proxy`");
    let source = std::error::Error::source(&err).unwrap();
    assert_eq!(source.to_string(), "fake failure: init");

    assert_eq!(manager.classifier().ops, [Op::Clear]);
    let netlink = manager.router().netlink();
    assert!(netlink.rules_removed().is_empty());
    assert_eq!(netlink.routes_removed(), [route(Family::V4), route(Family::V6)]);
    assert_eq!(manager.state(), State::Stopped);
}

#[tokio::test]
async fn noop_and_other_targets() {
    let mut config = config();
    config.rules = vec![
        Rule { pattern: "^/user.slice/ignored".into(), target: RuleTarget::Noop },
        Rule { pattern: "^/user.slice/direct".into(), target: RuleTarget::Direct },
        Rule { pattern: "^/user.slice/dropped".into(), target: RuleTarget::Drop },
        Rule { pattern: "^/user.slice/".into(), target: RuleTarget::Tproxy("proxy".into()) },
    ];

    let (manager, res) = run_with(
        &config,
        FakeClassifier::default(),
        FakeNetlink::default(),
        vec![
            CgroupEvent::created("/user.slice/ignored.service"),
            CgroupEvent::created("/user.slice/direct.service"),
            CgroupEvent::created("/user.slice/dropped.service"),
        ],
    )
    .await;

    res.unwrap();
    assert_eq!(
        manager.classifier().ops,
        [
            Op::Init(1),
            Op::AddCgroup("/user.slice/direct.service".into(), Target::Direct),
            Op::AddCgroup("/user.slice/dropped.service".into(), Target::Drop),
            Op::Clear,
        ]
    );
}
