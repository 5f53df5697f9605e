mod common;

use assets2036_rt::{Error, EventMessage, InMemoryBroker, Mode, Parameters};
use common::*;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};

// --- Properties ---

#[tokio::test]
async fn test_property_identical_writes_publish_once() {
    let broker = InMemoryBroker::new();
    let manager = connected_manager(&broker, "prop_ep").await;
    let person = submodel_json("person.json");
    let owner = manager.create_asset("person", &[&person]).await.unwrap();
    let age = owner.submodel("info").unwrap().property("age").unwrap();

    age.set_value(json!(42)).await.unwrap();
    age.set_value(json!(42)).await.unwrap();

    let publishes = broker.published_to("test_ns/person/info/age");
    assert_eq!(publishes.len(), 1, "Same value must go out once. Publishes: {:?}", publishes);
    assert!(publishes[0].retain);
    assert_eq!(broker.retained("test_ns/person/info/age"), Some(b"42".to_vec()));
}

#[tokio::test]
async fn test_property_replicates_to_consumer() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let person = submodel_json("person.json");

    let owner = provider.create_asset("person", &[&person]).await.unwrap();
    let proxy = consumer.create_asset_proxy("person", &[&person]).await.unwrap();
    assert_eq!(proxy.mode(), Mode::Consumer);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let changes_clone = changes.clone();
    let remote_age = proxy.submodel("info").unwrap().property("age").unwrap();
    remote_age
        .on_change(move |_, old, new| changes_clone.lock().unwrap().push((old.clone(), new.clone())))
        .unwrap();

    owner
        .submodel("info")
        .unwrap()
        .property("age")
        .unwrap()
        .set_value(json!(42))
        .await
        .unwrap();

    let observed = remote_age.clone();
    assert!(
        eventually(|| {
            let observed = observed.clone();
            async move { observed.value_i64().await.unwrap() == Some(42) }
        })
        .await,
        "Consumer never saw age = 42"
    );
    // Listeners run right after the cached value is updated.
    let notified = changes.clone();
    assert!(
        eventually(|| {
            let notified = notified.clone();
            async move { !notified.lock().unwrap().is_empty() }
        })
        .await
    );
    assert_eq!(*changes.lock().unwrap(), vec![(Value::Null, json!(42))]);
}

#[tokio::test]
async fn test_late_consumer_gets_retained_value() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let person = submodel_json("person.json");
    let owner = provider.create_asset("person", &[&person]).await.unwrap();
    let info = owner.submodel("info").unwrap();
    info.property("name").unwrap().set_value(json!("Ada")).await.unwrap();
    info.property("address")
        .unwrap()
        .set_value(json!({"street": "Main St 1", "zip": "70569"}))
        .await
        .unwrap();

    // A second handle on an already subscribed asset must still see the values.
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let first = consumer.create_asset_proxy("person", &[&person]).await.unwrap();
    let second = consumer.create_asset_proxy("person", &[&person]).await.unwrap();

    for proxy in [first, second] {
        let name = proxy.submodel("info").unwrap().property("name").unwrap();
        assert!(
            eventually(|| {
                let name = name.clone();
                async move { name.value_string().await.unwrap().as_deref() == Some("Ada") }
            })
            .await
        );
        let address = proxy.submodel("info").unwrap().property("address").unwrap();
        assert_eq!(address.get_value().await.unwrap()["zip"], json!("70569"));
    }
}

#[tokio::test]
async fn test_property_clear_reaches_consumer() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let person = submodel_json("person.json");
    let owner = provider.create_asset("person", &[&person]).await.unwrap();
    let proxy = consumer.create_asset_proxy("person", &[&person]).await.unwrap();

    let age = owner.submodel("info").unwrap().property("age").unwrap();
    let remote_age = proxy.submodel("info").unwrap().property("age").unwrap();
    age.set_value(json!(42)).await.unwrap();
    let observed = remote_age.clone();
    assert!(
        eventually(|| {
            let observed = observed.clone();
            async move { observed.value_i64().await.unwrap() == Some(42) }
        })
        .await
    );

    age.clear().await.unwrap();
    assert_eq!(broker.retained("test_ns/person/info/age"), None);
    let observed = remote_age.clone();
    assert!(
        eventually(|| {
            let observed = observed.clone();
            async move { observed.get_value().await.unwrap().is_null() }
        })
        .await,
        "Consumer still holds the cleared value"
    );
}

#[tokio::test]
async fn test_property_mode_and_type_checks() {
    let broker = InMemoryBroker::new();
    let manager = connected_manager(&broker, "mode_ep").await;
    let person = submodel_json("person.json");
    let owner = manager.create_asset("person", &[&person]).await.unwrap();
    let proxy = manager.create_asset_proxy("person", &[&person]).await.unwrap();

    let owned_age = owner.submodel("info").unwrap().property("age").unwrap();
    let remote_age = proxy.submodel("info").unwrap().property("age").unwrap();

    assert!(matches!(owned_age.get_value().await, Err(Error::WrongMode { .. })));
    assert!(matches!(
        remote_age.set_value(json!(1)).await,
        Err(Error::WrongMode { mode: Mode::Consumer, .. })
    ));
    assert!(matches!(
        owned_age.set_value(json!("forty")).await,
        Err(Error::InvalidParameter { .. })
    ));
    assert!(broker.published_to("test_ns/person/info/age").is_empty());
    assert!(matches!(
        owner.submodel("info").unwrap().property("height"),
        Err(Error::ElementNotFound { kind: "property", .. })
    ));
    assert!(matches!(owner.submodel("nope"), Err(Error::SubmodelNotFound { .. })));
}

// --- Events ---

#[tokio::test]
async fn test_event_emission_reaches_listener() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let person = submodel_json("person.json");
    let owner = provider.create_asset("person", &[&person]).await.unwrap();
    let proxy = consumer.create_asset_proxy("person", &[&person]).await.unwrap();

    let received: Arc<Mutex<Vec<EventMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    proxy
        .submodel("info")
        .unwrap()
        .event("birthday")
        .unwrap()
        .on_event(move |event, message| {
            assert_eq!(event.name(), "birthday");
            received_clone.lock().unwrap().push(message.clone());
        })
        .unwrap();

    let birthday = owner.submodel("info").unwrap().event("birthday").unwrap();
    assert!(matches!(
        birthday.emit(params(&[("age", json!("old"))])).await,
        Err(Error::InvalidParameter { .. })
    ));
    birthday.emit(params(&[("age", json!(43))])).await.unwrap();

    let records = broker.published_to("test_ns/person/info/birthday");
    assert_eq!(records.len(), 1);
    assert!(!records[0].retain, "Events are not retained");

    let seen = received.clone();
    assert!(eventually(|| {
        let seen = seen.clone();
        async move { !seen.lock().unwrap().is_empty() }
    })
    .await);
    let messages = received.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].param_i64("age"), Some(43));
}

#[tokio::test]
async fn test_event_with_foreign_timestamp_formats() {
    let broker = InMemoryBroker::new();
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let person = submodel_json("person.json");
    let proxy = consumer.create_asset_proxy("person", &[&person]).await.unwrap();

    let count = Arc::new(Mutex::new(0));
    let count_clone = count.clone();
    proxy
        .submodel("info")
        .unwrap()
        .event("birthday")
        .unwrap()
        .on_event(move |_, _| *count_clone.lock().unwrap() += 1)
        .unwrap();

    let topic = "test_ns/person/info/birthday";
    broker.publish(topic, r#"{"timestamp": "2024-05-01T12:00:00.123Z", "params": {"age": 1}}"#, false);
    broker.publish(topic, r#"{"timestamp": "2024-05-01T12:00:00", "params": {"age": 2}}"#, false);
    broker.publish(topic, r#"{"timestamp": 1714564800000, "params": {"age": 3}}"#, false);
    broker.publish(topic, r#"{"timestamp": "yesterday", "params": {}}"#, false);

    let seen = count.clone();
    assert!(eventually(|| {
        let seen = seen.clone();
        async move { *seen.lock().unwrap() == 3 }
    })
    .await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(*count.lock().unwrap(), 3);
}

// --- Operations ---

fn bind_math(asset: &assets2036_rt::Asset) {
    let math = asset.submodel("math").unwrap();
    math.operation("square")
        .unwrap()
        .bind(|req| {
            let x = req.param_f64("x").ok_or_else(|| Error::Other("x missing".into()))?;
            Ok(json!(x * x))
        })
        .unwrap();
    math.operation("sqrt")
        .unwrap()
        .bind(|req| Ok(json!(req.param_f64("x").unwrap_or_default().sqrt())))
        .unwrap();
    math.operation("sin")
        .unwrap()
        .bind(|req| Ok(json!(req.param_f64("x").unwrap_or_default().sin())))
        .unwrap();
}

#[tokio::test]
async fn test_operation_round_trip() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let math = submodel_json("math.json");
    let owner = provider.create_asset("calc", &[&math]).await.unwrap();
    bind_math(&owner);
    let proxy = consumer.create_asset_proxy("calc", &[&math]).await.unwrap();

    let square = proxy.submodel("math").unwrap().operation("square").unwrap();
    let result = square.invoke(params(&[("x", json!(7))])).await.unwrap();
    assert_eq!(result.as_f64(), Some(49.0));
    assert!(!square.invocation_running());

    assert!(matches!(
        square.invoke(Parameters::new()).await,
        Err(Error::InvalidParameter { .. })
    ));
    let owned_square = owner.submodel("math").unwrap().operation("square").unwrap();
    assert!(matches!(
        owned_square.invoke(params(&[("x", json!(1))])).await,
        Err(Error::WrongMode { .. })
    ));
}

#[tokio::test]
async fn test_operation_unbound_times_out() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let math = submodel_json("math.json");
    let _owner = provider.create_asset("calc", &[&math]).await.unwrap();
    let proxy = consumer.create_asset_proxy("calc", &[&math]).await.unwrap();

    let started = Instant::now();
    let outcome = proxy
        .submodel("math")
        .unwrap()
        .operation("unimplemented")
        .unwrap()
        .invoke_with_timeout(params(&[("x", json!(1))]), Duration::from_millis(300))
        .await;
    let elapsed = started.elapsed();
    assert!(
        matches!(outcome, Err(Error::OperationTimeoutError { timeout_ms: 300, .. })),
        "Expected a timeout, got {:?}",
        outcome
    );
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn test_failing_provider_sends_no_reply() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let math = submodel_json("math.json");
    let owner = provider.create_asset("calc", &[&math]).await.unwrap();
    let math_sm = owner.submodel("math").unwrap();
    math_sm
        .operation("square")
        .unwrap()
        .bind(|_| Err(Error::Other("provider broke".into())))
        .unwrap();
    math_sm
        .operation("sqrt")
        .unwrap()
        .bind(|_| panic!("provider panicked"))
        .unwrap();
    let proxy = consumer.create_asset_proxy("calc", &[&math]).await.unwrap();

    for name in ["square", "sqrt"] {
        let outcome = proxy
            .submodel("math")
            .unwrap()
            .operation(name)
            .unwrap()
            .invoke_with_timeout(params(&[("x", json!(4))]), Duration::from_millis(300))
            .await;
        assert!(matches!(outcome, Err(Error::OperationTimeoutError { .. })), "{}: {:?}", name, outcome);
    }
    assert!(broker.published_to("test_ns/calc/math/square/RESP").is_empty());
    assert!(broker.published_to("test_ns/calc/math/sqrt/RESP").is_empty());
}

#[tokio::test]
async fn test_concurrent_distinct_operations() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let math = submodel_json("math.json");
    let owner = provider.create_asset("calc", &[&math]).await.unwrap();
    bind_math(&owner);
    let proxy = consumer.create_asset_proxy("calc", &[&math]).await.unwrap();
    let math_sm = proxy.submodel("math").unwrap();

    let functions: [(&str, fn(f64) -> f64); 3] = [("square", |x| x * x), ("sqrt", f64::sqrt), ("sin", f64::sin)];
    let mut tasks = Vec::new();
    for (offset, (name, expected)) in functions.into_iter().enumerate() {
        let operation = math_sm.operation(name).unwrap();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let x = (i * 3 + offset) as f64;
                let result = operation.invoke(params(&[("x", json!(x))])).await.unwrap();
                let got = result.as_f64().unwrap();
                assert!((got - expected(x)).abs() < 1e-9, "{}({}) returned {}", name, x, got);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_listener_does_not_delay_replies() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let math = submodel_json("math.json");
    let person = submodel_json("person.json");
    let owner = provider.create_asset("calc", &[&math, &person]).await.unwrap();
    bind_math(&owner);
    let proxy = consumer.create_asset_proxy("calc", &[&math, &person]).await.unwrap();

    let entered = Arc::new(Mutex::new(false));
    let entered_clone = entered.clone();
    proxy
        .submodel("info")
        .unwrap()
        .property("age")
        .unwrap()
        .on_change(move |_, _, _| {
            *entered_clone.lock().unwrap() = true;
            std::thread::sleep(std::time::Duration::from_millis(2000));
        })
        .unwrap();

    owner
        .submodel("info")
        .unwrap()
        .property("age")
        .unwrap()
        .set_value(json!(1))
        .await
        .unwrap();
    let busy = entered.clone();
    assert!(
        eventually(|| {
            let busy = busy.clone();
            async move { *busy.lock().unwrap() }
        })
        .await
    );

    let started = Instant::now();
    let result = proxy
        .submodel("math")
        .unwrap()
        .operation("square")
        .unwrap()
        .invoke_with_timeout(params(&[("x", json!(3))]), Duration::from_millis(1000))
        .await;
    assert_eq!(result.unwrap().as_f64(), Some(9.0));
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn test_malformed_traffic_does_not_stop_dispatch() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let math = submodel_json("math.json");
    let person = submodel_json("person.json");
    let owner = provider.create_asset("calc", &[&math, &person]).await.unwrap();
    bind_math(&owner);
    let proxy = consumer.create_asset_proxy("calc", &[&math, &person]).await.unwrap();

    broker.publish("test_ns/calc/info/age", "not json", false);
    broker.publish("test_ns/calc/info/birthday", "{\"params\": 5}", false);
    broker.publish("test_ns/calc/math/square/REQ", "{", false);
    broker.publish("test_ns/calc/math/square/RESP", "[]", false);
    broker.publish("test_ns/calc/math/square/RESP", r#"{"req_id": "nobody", "resp": 1}"#, false);
    broker.publish("test_ns/calc/math/nothing/REQ", r#"{"req_id": "x", "params": {}}"#, false);
    broker.publish("test_ns/calc/unknown/element", "1", false);
    broker.publish("test_ns/calc", "1", false);

    owner
        .submodel("info")
        .unwrap()
        .property("age")
        .unwrap()
        .set_value(json!(7))
        .await
        .unwrap();
    let age = proxy.submodel("info").unwrap().property("age").unwrap();
    assert!(
        eventually(|| {
            let age = age.clone();
            async move { age.value_i64().await.unwrap() == Some(7) }
        })
        .await
    );
    let result = proxy
        .submodel("math")
        .unwrap()
        .operation("square")
        .unwrap()
        .invoke(params(&[("x", json!(3))]))
        .await
        .unwrap();
    assert_eq!(result.as_f64(), Some(9.0));
}

// --- Descriptors ---

#[tokio::test]
async fn test_create_asset_with_file_url_submodel() {
    let broker = InMemoryBroker::new();
    let manager = connected_manager(&broker, "file_ep").await;
    let file_url = format!("file://{}", submodel_path("simple_prop_sm.json"));

    let asset = manager.create_asset("TestAssetFile", &[&file_url]).await.unwrap();
    let status = asset.submodel("SimplePropSM").unwrap().property("status").unwrap();
    status.set_value(json!("busy")).await.unwrap();
    assert!(matches!(
        status.set_value(json!("sleeping")).await,
        Err(Error::InvalidParameter { .. })
    ));

    let meta = broker
        .retained("test_ns/TestAssetFile/SimplePropSM/_meta")
        .expect("_meta for SimplePropSM was not published");
    let meta: Value = serde_json::from_slice(&meta).unwrap();
    assert_eq!(meta["submodel_definition"]["name"], "SimplePropSM");
    assert_eq!(meta["submodel_url"], json!(file_url));
    assert_eq!(meta["source"], "test_ns/file_ep");
}

#[tokio::test]
async fn test_create_asset_with_http_url_submodel() {
    let broker = InMemoryBroker::new();
    let manager = connected_manager(&broker, "http_ep").await;
    let server = httpmock::MockServer::start_async().await;
    let sm_mock = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/submodels/HttpLoadedSM.json");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"name": "HttpLoadedSM", "properties": {"data": {"type": "string"}}}"#);
        })
        .await;
    let http_url = server.url("/submodels/HttpLoadedSM.json");

    let asset = manager.create_asset("TestAssetHttp", &[&http_url]).await.unwrap();
    sm_mock.assert_async().await;
    assert!(asset.submodel("HttpLoadedSM").unwrap().get_property("data").is_some());

    let meta: Value =
        serde_json::from_slice(&broker.retained("test_ns/TestAssetHttp/HttpLoadedSM/_meta").unwrap()).unwrap();
    assert_eq!(meta["submodel_url"], json!(http_url));
}

#[tokio::test]
async fn test_unloadable_descriptors_are_skipped() {
    let broker = InMemoryBroker::new();
    let manager = connected_manager(&broker, "skip_ep").await;
    let server = httpmock::MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.path("/broken.json");
            then.status(500);
        })
        .await;
    let broken_url = server.url("/broken.json");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", r#"{"name": "from_file", "properties": {"x": {"type": "number"}}}"#).unwrap();
    let file_url = format!("file://{}", file.path().display());

    let asset = manager
        .create_asset(
            "mixed",
            &[
                r#"{"name": "inline_sm", "events": {"ping": {}}}"#,
                &file_url,
                "file:///definitely/not/here.json",
                &broken_url,
                "ftp://example.com/sm.json",
                r#"{"name": "bad/name"}"#,
                r#"{"name": "dup", "properties": {"a": {}}, "events": {"a": {}}}"#,
                r#"{"name": "meta_clash", "properties": {"_meta": {}}}"#,
                "{ not json",
            ],
        )
        .await
        .unwrap();

    let expected: BTreeSet<String> = ["inline_sm", "from_file"].iter().map(|s| s.to_string()).collect();
    assert_eq!(asset.submodel_names(), expected);
}

#[tokio::test]
async fn test_invalid_asset_names_are_rejected() {
    let broker = InMemoryBroker::new();
    let manager = connected_manager(&broker, "names_ep").await;
    let math = submodel_json("math.json");
    assert!(matches!(
        manager.create_asset("a/b", &[&math]).await,
        Err(Error::InvalidParameter { .. })
    ));
    assert!(matches!(
        manager.create_asset_proxy_in("ns+", "calc", &[&math]).await,
        Err(Error::InvalidParameter { .. })
    ));
}

// --- Discovery ---

#[tokio::test]
async fn test_full_proxy_discovers_all_submodels() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let sources = [
        submodel_json("math.json"),
        submodel_json("person.json"),
        submodel_json("simple_prop_sm.json"),
    ];
    let source_refs: Vec<&str> = sources.iter().map(String::as_str).collect();
    let owner = provider.create_asset("robot", &source_refs).await.unwrap();
    bind_math(&owner);
    let _other = provider.create_asset("robot_2", &source_refs[..1]).await.unwrap();

    let proxy = consumer.create_full_asset_proxy(NAMESPACE, "robot").await.unwrap();
    let expected: BTreeSet<String> = ["math", "info", "SimplePropSM"].iter().map(|s| s.to_string()).collect();
    assert_eq!(proxy.submodel_names(), expected);
    assert_eq!(proxy.mode(), Mode::Consumer);

    let result = proxy
        .submodel("math")
        .unwrap()
        .operation("square")
        .unwrap()
        .invoke(params(&[("x", json!(5))]))
        .await
        .unwrap();
    assert_eq!(result.as_f64(), Some(25.0));
    let meta = proxy.submodel("info").unwrap().meta_property();
    assert_eq!(meta.get_value().await.unwrap()["source"], "test_ns/provider_ep");
}

#[tokio::test]
async fn test_full_proxy_for_unknown_asset_fails() {
    let broker = InMemoryBroker::new();
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let outcome = consumer.create_full_asset_proxy(NAMESPACE, "ghost").await;
    assert!(
        matches!(outcome, Err(Error::AssetNotFoundError { ref name, .. }) if name == "ghost"),
        "{:?}",
        outcome
    );
}

#[tokio::test]
async fn test_query_assets_by_submodels() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let math = submodel_json("math.json");
    let person = submodel_json("person.json");
    provider.create_asset("robot_a", &[&math]).await.unwrap();
    provider.create_asset("robot_b", &[&math, &person]).await.unwrap();
    provider.create_asset_in("elsewhere", "robot_c", &[&math]).await.unwrap();

    let both = consumer.query_assets(Some(NAMESPACE), &["math", "info"]).await.unwrap();
    assert_eq!(both, vec!["test_ns/robot_b".to_string()]);

    let with_math = consumer.query_assets(Some(NAMESPACE), &["math"]).await.unwrap();
    assert_eq!(with_math, vec!["test_ns/robot_a".to_string(), "test_ns/robot_b".to_string()]);

    let everywhere = consumer.query_assets(None, &["math"]).await.unwrap();
    assert!(everywhere.contains(&"elsewhere/robot_c".to_string()));

    let endpoints = consumer.query_assets(None, &["_endpoint"]).await.unwrap();
    assert!(endpoints.contains(&"test_ns/provider_ep".to_string()));
    assert!(endpoints.contains(&"test_ns/consumer_ep".to_string()));

    let described = consumer.supported_submodels(NAMESPACE, "robot_b").await.unwrap();
    let names: BTreeSet<&str> = described.iter().map(|d| d.name()).collect();
    assert_eq!(names, ["info", "math"].into_iter().collect());
}

// --- Release ---

#[tokio::test]
async fn test_released_handle_stops_receiving() {
    let broker = InMemoryBroker::new();
    let provider = connected_manager(&broker, "provider_ep").await;
    let consumer = connected_manager(&broker, "consumer_ep").await;
    let person = submodel_json("person.json");
    let owner = provider.create_asset("person", &[&person]).await.unwrap();
    let kept = consumer.create_asset_proxy("person", &[&person]).await.unwrap();
    let released = consumer.create_asset_proxy("person", &[&person]).await.unwrap();
    let age = owner.submodel("info").unwrap().property("age").unwrap();

    age.set_value(json!(1)).await.unwrap();
    let released_age = released.submodel("info").unwrap().property("age").unwrap();
    let observed = released_age.clone();
    assert!(
        eventually(|| {
            let observed = observed.clone();
            async move { observed.value_i64().await.unwrap() == Some(1) }
        })
        .await
    );

    consumer.release(&released).await.unwrap();
    assert!(released.is_released());
    released.release().await.unwrap();

    age.set_value(json!(2)).await.unwrap();
    let kept_age = kept.submodel("info").unwrap().property("age").unwrap();
    assert!(
        eventually(|| {
            let kept_age = kept_age.clone();
            async move { kept_age.value_i64().await.unwrap() == Some(2) }
        })
        .await,
        "The remaining handle must keep receiving updates"
    );
    sleep(Duration::from_millis(50)).await;
    assert_eq!(released_age.value_i64().await.unwrap(), Some(1));
}
