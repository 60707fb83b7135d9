//! End-to-end pipeline tests: policy YAML in, cloud calls out.

use std::sync::Arc;

use serde_json::{Value, json};
use warden_core::cache::Cache;
use warden_core::client::StaticSessionFactory;
use warden_core::context::Clock;
use warden_core::resource::ResourceTypeDef;
use warden_policy::actions::CloudOpAction;
use warden_policy::provider::{Provider, ResourcePlugin};
use warden_runtime::{PolicyCollection, RunOptions};

fn ec2_provider() -> Provider {
    let mut def = ResourceTypeDef::new(
        "ec2",
        "ec2",
        "InstanceId",
        "DescribeInstances",
        "Reservations[].Instances[]",
    );
    def.taggable = true;
    let mut provider = Provider::new("static");
    provider
        .register_resource(
            ResourcePlugin::new(def)
                .with_action(
                    "delete",
                    CloudOpAction::plugin(
                        "delete",
                        "TerminateInstances",
                        "InstanceIds",
                        &["ec2:TerminateInstances"],
                    ),
                )
                .unwrap()
                .with_action(
                    "stop",
                    CloudOpAction::plugin(
                        "stop",
                        "StopInstances",
                        "InstanceIds",
                        &["ec2:StopInstances"],
                    ),
                )
                .unwrap(),
        )
        .unwrap();
    provider.finalize();
    provider
}

fn instances_page(instances: Vec<Value>) -> Value {
    json!({"Reservations": [{"Instances": instances}]})
}

fn options_at(now: &str) -> RunOptions {
    RunOptions {
        clock: Clock::Fixed(now.parse().unwrap()),
        ..RunOptions::default()
    }
}

#[test]
fn age_filter_selects_old_resources_at_a_fixed_instant() {
    let provider = ec2_provider();
    let doc = r#"
policies:
  - name: old-instances
    resource: ec2
    filters:
      - type: value
        key: Created
        op: gt
        value: 20
        value_type: age
"#;
    let collection = PolicyCollection::load_str(doc, &provider, None).unwrap();
    let factory = StaticSessionFactory::new("123456789012");
    factory.client_handle().respond(
        "ec2",
        "DescribeInstances",
        vec![instances_page(vec![
            json!({"InstanceId": "i-old", "Created": "2020-01-01T00:00:00Z"}),
            json!({"InstanceId": "i-new", "Created": "2020-01-25T00:00:00Z"}),
        ])],
    );

    let result = collection.policies[0]
        .push(None, &factory, &options_at("2020-02-01T00:00:00Z"))
        .unwrap();
    // 31 days > 20; 7 days is not.
    assert_eq!(result.resource_count, 1);
}

#[test]
fn mark_for_op_then_marked_for_op_across_clock_skew() {
    let provider = ec2_provider();

    // Run 1: stopped instances get marked for delete in 4 days.
    let mark_doc = r#"
policies:
  - name: mark-stopped
    resource: ec2
    filters:
      - State.Name: stopped
    actions:
      - type: mark-for-op
        op: delete
        days: 4
"#;
    let collection = PolicyCollection::load_str(mark_doc, &provider, None).unwrap();
    let factory = StaticSessionFactory::new("123456789012");
    factory.client_handle().respond(
        "ec2",
        "DescribeInstances",
        vec![instances_page(vec![
            json!({"InstanceId": "i-stopped", "State": {"Name": "stopped"}}),
            json!({"InstanceId": "i-running", "State": {"Name": "running"}}),
        ])],
    );
    let run1 = collection.policies[0]
        .push(None, &factory, &options_at("2026-03-01T00:00:00Z"))
        .unwrap();
    assert!(run1.success);
    assert_eq!(run1.resource_count, 1);

    let calls = factory.client_handle().calls();
    let tag_call = calls.iter().find(|c| c.operation == "CreateTags").unwrap();
    let stamp = tag_call.params["tags"][0]["Value"].as_str().unwrap();
    assert_eq!(tag_call.params["ids"], json!(["i-stopped"]));
    assert!(stamp.ends_with("delete@2026/03/05"), "stamp was {stamp}");

    // Run 2 at t0+5d: the marked instance is due; the unmarked is not.
    let sweep_doc = r#"
policies:
  - name: sweep-marked
    resource: ec2
    filters:
      - type: marked-for-op
        op: delete
    actions:
      - delete
"#;
    let collection = PolicyCollection::load_str(sweep_doc, &provider, None).unwrap();
    let factory = StaticSessionFactory::new("123456789012");
    factory.client_handle().respond(
        "ec2",
        "DescribeInstances",
        vec![instances_page(vec![
            json!({
                "InstanceId": "i-stopped",
                "Tags": [{"Key": "warden_status", "Value": stamp}],
            }),
            json!({"InstanceId": "i-running"}),
        ])],
    );
    let run2 = collection.policies[0]
        .push(None, &factory, &options_at("2026-03-06T00:00:00Z"))
        .unwrap();
    assert_eq!(run2.resource_count, 1);
    let deletes = factory.client_handle().calls();
    let delete = deletes
        .iter()
        .find(|c| c.operation == "TerminateInstances")
        .unwrap();
    assert_eq!(delete.params["InstanceIds"], json!(["i-stopped"]));
}

#[test]
fn dry_run_writes_the_same_matched_set_but_mutates_nothing() {
    let provider = ec2_provider();
    let doc = r#"
policies:
  - name: stop-dev
    resource: ec2
    filters:
      - "tag:Env": dev
    actions:
      - stop
"#;
    let pages = vec![instances_page(vec![
        json!({"InstanceId": "i-1", "Tags": [{"Key": "Env", "Value": "dev"}]}),
        json!({"InstanceId": "i-2", "Tags": [{"Key": "Env", "Value": "prod"}]}),
    ])];

    let run = |dry_run: bool| -> (Value, usize) {
        let collection = PolicyCollection::load_str(doc, &provider, None).unwrap();
        let factory = StaticSessionFactory::new("123456789012");
        factory
            .client_handle()
            .respond("ec2", "DescribeInstances", pages.clone());
        let root = tempfile::tempdir().unwrap();
        let opts = RunOptions {
            output_dir: Some(root.path().to_path_buf()),
            dry_run,
            ..options_at("2026-01-01T00:00:00Z")
        };
        let result = collection.policies[0].push(None, &factory, &opts).unwrap();
        assert!(result.success);

        let run_dir = std::fs::read_dir(root.path().join("stop-dev"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let resources: Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("resources.json")).unwrap())
                .unwrap();
        let mutations = factory
            .client_handle()
            .calls()
            .iter()
            .filter(|c| c.operation == "StopInstances")
            .count();
        (resources, mutations)
    };

    let (wet_resources, wet_mutations) = run(false);
    let (dry_resources, dry_mutations) = run(true);
    assert_eq!(wet_resources, dry_resources);
    assert_eq!(wet_mutations, 1);
    assert_eq!(dry_mutations, 0);
}

#[test]
fn policy_yaml_round_trips_structurally() {
    let provider = ec2_provider();
    let doc = r#"
policies:
  - name: round-trip
    resource: ec2
    description: structural stability
    max-resources: 100
    filters:
      - type: value
        key: State.Name
        value: running
    actions:
      - type: mark-for-op
        op: stop
        days: 2
"#;
    let collection = PolicyCollection::load_str(doc, &provider, None).unwrap();
    let serialized = serde_json::to_string(&collection.policies[0].data).unwrap();
    let reparsed: warden_runtime::PolicyData = serde_json::from_str(&serialized).unwrap();
    let collection2 = PolicyCollection::load_str(
        &serde_yaml::to_string(&json!({"policies": [reparsed]})).unwrap(),
        &provider,
        None,
    )
    .unwrap();
    assert_eq!(
        serde_json::to_value(&collection.policies[0].data).unwrap(),
        serde_json::to_value(&collection2.policies[0].data).unwrap(),
    );
}

#[test]
fn shared_cache_spares_sibling_policies_the_enumeration() {
    let provider = ec2_provider();
    let doc = r#"
policies:
  - name: first
    resource: ec2
  - name: second
    resource: ec2
"#;
    let collection = PolicyCollection::load_str(doc, &provider, None).unwrap();
    let factory = StaticSessionFactory::new("123456789012");
    factory.client_handle().respond(
        "ec2",
        "DescribeInstances",
        vec![instances_page(vec![json!({"InstanceId": "i-1"})])],
    );
    let opts = RunOptions {
        cache: Arc::new(Cache::new(std::time::Duration::from_secs(300))),
        ..RunOptions::default()
    };
    let selected = collection.select(None, None).unwrap();
    let result = collection.run(&selected, None, &factory, &opts, 1);
    assert!(!result.partial());
    assert_eq!(factory.client_handle().call_count("ec2", "DescribeInstances"), 1);
}
