//! End-to-end tests over real sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use steward_protocol::{DealerStream, Request, Response, Serializer, SubscribeStream};
use steward_server::{
    Builtin, DispatchError, EventHandler, Interval, ServerBuilder, ServerConfig, ServerError,
    ServerResult, ShutdownHandle, Task, Visibility,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    _dir: TempDir,
    config: ServerConfig,
    shutdown: ShutdownHandle,
    task: JoinHandle<ServerResult<()>>,
}

impl Running {
    async fn dealer(&self) -> DealerStream {
        DealerStream::connect(&self.config.socket_path, self.config.serializer())
            .await
            .unwrap()
    }

    async fn subscriber(&self, prefix: &str) -> SubscribeStream {
        let mut sub = SubscribeStream::connect(&self.config.publish_path, self.config.serializer())
            .await
            .unwrap();
        sub.subscribe(prefix).await.unwrap();
        // the publisher registers the prefix asynchronously
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub
    }

    async fn stop(self) -> ServerResult<()> {
        self.shutdown.trigger();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap()
    }
}

fn config(dir: &TempDir) -> ServerConfig {
    ServerConfig::new(dir.path().join("steward.sock"), dir.path().join("steward-pub.sock"))
        .with_poll_interval(Duration::from_millis(20))
        .with_scheduler_sleep(Duration::from_millis(20), Duration::from_millis(20))
        .with_drain_timeout(Duration::from_secs(2))
}

async fn start(setup: impl FnOnce(&mut ServerBuilder)) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let mut builder = ServerBuilder::new(config.clone());
    builder.extension(Builtin).unwrap();
    setup(&mut builder);

    let server = builder.bind().await.unwrap();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());
    Running {
        _dir: dir,
        config,
        shutdown,
        task,
    }
}

async fn call(dealer: &mut DealerStream, request: Request) -> Result<Value, String> {
    let nonce = request.nonce;
    dealer.send(&serde_json::to_value(&request).unwrap()).await.unwrap();
    loop {
        let raw = dealer.receive_timeout(WAIT).await.unwrap();
        let response: Response = serde_json::from_value(raw).unwrap();
        assert_eq!(response.nonce(), nonce);
        if let Some(outcome) = response.into_outcome() {
            return outcome;
        }
    }
}

#[tokio::test]
async fn ping_and_listing() {
    let server = start(|_| {}).await;
    let mut dealer = server.dealer().await;

    assert_eq!(call(&mut dealer, Request::new("ping", 1)).await, Ok(json!("pong")));

    let listing = call(&mut dealer, Request::new("commands", 2)).await.unwrap();
    let names: Vec<&str> = listing
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|entry| entry[0].as_str())
        .collect();
    assert!(names.contains(&"tasks.schedule"));
    assert!(!names.contains(&"background"));

    let err = call(&mut dealer, Request::new("background", 3).arg("ping"))
        .await
        .unwrap_err();
    assert!(err.contains("background"), "{err}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn compressed_cbor_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir)
        .with_codec(steward_protocol::Codec::Cbor)
        .with_compression(true);
    let mut builder = ServerBuilder::new(config.clone());
    builder.extension(Builtin).unwrap();
    let server = builder.bind().await.unwrap();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    let mut dealer = DealerStream::connect(&config.socket_path, Serializer::cbor().compressed())
        .await
        .unwrap();
    assert_eq!(call(&mut dealer, Request::new("ping", 1)).await, Ok(json!("pong")));

    shutdown.trigger();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn published_events_reach_subscribers() {
    let server = start(|builder| {
        builder.event_handler(
            EventHandler::new("redact", "deploy\\.", |_, payload, _| {
                if let Some(map) = payload.as_object_mut() {
                    map.remove("token");
                }
                Ok(false)
            })
            .unwrap(),
        );
        builder.event_handler(EventHandler::new("gate", "secret", |_, _, _| Ok(true)).unwrap());
    })
    .await;
    let mut sub = server.subscriber("").await;
    let mut dealer = server.dealer().await;

    let vetoed = Request::new("pub", 1).arg("secret.rotate");
    assert_eq!(call(&mut dealer, vetoed).await, Ok(json!(true)));
    let request = Request::new("pub", 2)
        .arg("deploy.done")
        .kwarg("host", "web1")
        .kwarg("token", "hunter2");
    assert_eq!(call(&mut dealer, request).await, Ok(json!(true)));

    let event = sub.receive_timeout(WAIT).await.unwrap();
    assert_eq!(event.topic, "deploy.done");
    assert_eq!(event.payload, json!({"host": "web1"}));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn start_hooks_run_before_commands() {
    let ready = Arc::new(AtomicBool::new(false));
    let hook_flag = ready.clone();
    let check_flag = ready.clone();
    let server = start(move |builder| {
        builder.on_start("warm-up", move |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            hook_flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        builder
            .capability("ready", Visibility::Public, "", move |_ctx, _call| {
                let flag = check_flag.clone();
                async move { Ok(json!(flag.load(Ordering::SeqCst))) }
            })
            .unwrap();
    })
    .await;
    let mut dealer = server.dealer().await;

    assert_eq!(call(&mut dealer, Request::new("ready", 1)).await, Ok(json!(true)));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn failing_start_hook_stops_the_server() {
    let server = start(|builder| {
        builder.on_start("broken", |_ctx| async {
            Err(DispatchError::execution("no database"))
        });
    })
    .await;

    let result = tokio::time::timeout(WAIT, server.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::StartHook { name, .. }) if name == "broken"));
}

#[tokio::test]
async fn scheduled_tasks_publish() {
    let server = start(|builder| {
        builder.task(Task::new(
            "heartbeat",
            Interval(Duration::from_millis(50)),
            |ctx| async move {
                ctx.publish("heartbeat", json!({"alive": true}));
                Ok(())
            },
        ));
    })
    .await;
    let mut sub = server.subscriber("heart").await;

    let event = sub.receive_timeout(WAIT).await.unwrap();
    assert_eq!(event.topic, "heartbeat");
    assert_eq!(event.payload, json!({"alive": true}));

    let mut dealer = server.dealer().await;
    let schedule = call(&mut dealer, Request::new("tasks.schedule", 1)).await.unwrap();
    assert!(schedule.as_str().unwrap().starts_with("heartbeat: "));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_running_commands() {
    let server = start(|_| {}).await;
    let mut dealer = server.dealer().await;

    let request = Request::new("sleep", 1).arg(0.3);
    dealer.send(&serde_json::to_value(&request).unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown.trigger();

    let raw = dealer.receive_timeout(WAIT).await.unwrap();
    let response: Response = serde_json::from_value(raw).unwrap();
    assert_eq!(response, Response::success(1, true));
    tokio::time::timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
}
