mod common;

use std::sync::Arc;
use std::time::Duration;

use storyforge_core::channel::{
    ChannelClient, ChannelConfig, ChannelMessage, ClientEvent, ClientExit, Connector, ReconnectPolicy,
};
use storyforge_core::generation::ScriptedAdapter;
use storyforge_core::state::{EntryRole, StagePayload};
use storyforge_core::{ForgeError, SessionInput, SessionStatus, Stage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{runtime, test_config};

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay_ms: 5,
        multiplier: 2.0,
        max_delay_ms: 20,
        max_attempts: 5,
    }
}

#[tokio::test]
async fn test_client_follows_session_across_idle_reconnects() {
    let mut config = test_config();
    config.channel = ChannelConfig {
        heartbeat_interval_ms: 10,
        idle_timeout_ms: 60,
        buffer: 16,
    };
    let rt = runtime(Arc::new(ScriptedAdapter::new()), config);
    let orch = rt.orchestrator.clone();
    let id = orch.start("alice", SessionInput::new("a moon garden")).await.unwrap();

    let connector = rt.local_connector();
    let client = ChannelClient::new(Arc::new(connector.clone()), Arc::new(orch.clone()), fast_policy());
    let (tx, mut rx) = mpsc::channel(256);
    let follower = {
        let id = id.clone();
        tokio::spawn(async move { client.run(&id, tx, CancellationToken::new()).await })
    };
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    // quiet long enough for the server to drop the client at least twice
    tokio::time::sleep(Duration::from_millis(200)).await;

    for stage in [Stage::Story, Stage::ReferenceImage, Stage::Storyboard, Stage::Video] {
        orch.run_stage_with_pause(&id).await.unwrap();
        orch.approve(&id, Some(stage)).await.unwrap();
    }

    let exit = tokio::time::timeout(Duration::from_secs(5), follower)
        .await
        .expect("client should stop once the session completes")
        .unwrap();
    assert_eq!(exit, ClientExit::SessionTerminal(SessionStatus::Complete));

    let events = collector.await.unwrap();
    let resyncs = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::Resynced(_)))
        .count();
    let disconnects = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::Disconnected { .. }))
        .count();
    assert!(resyncs >= 3, "resyncs: {}", resyncs);
    assert!(disconnects >= 2, "disconnects: {}", disconnects);
    assert!(connector.connections() >= 3);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ClientEvent::GaveUp { .. })));
}

#[tokio::test]
async fn test_socket_feedback_regenerates_through_the_owner() {
    let rt = runtime(Arc::new(ScriptedAdapter::new()), test_config());
    let orch = rt.orchestrator.clone();
    let id = orch.start("alice", SessionInput::new("a clockwork fox")).await.unwrap();
    orch.run_stage_with_pause(&id).await.unwrap();

    let connector = rt.local_connector();
    let (mut sink, mut stream) = connector.connect(&id).await.unwrap();
    sink.send(&ChannelMessage::Feedback {
        content: "make it funnier".into(),
    })
    .await
    .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = stream.next_frame().await {
            if let ChannelMessage::StageComplete { stage, version, .. } = frame.unwrap() {
                return Some((stage, version));
            }
        }
        None
    })
    .await
    .unwrap();
    let (stage, version) = completed.expect("stage_complete after feedback");
    assert_eq!(stage, Stage::Story);

    let session = orch.status(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Paused);
    assert!(session.version >= version);
    assert!(session
        .history
        .iter()
        .any(|e| e.role == EntryRole::Feedback && e.content == "make it funnier"));
    match &session.current_result().unwrap().payload {
        StagePayload::Story { text } => assert!(text.contains("funnier")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_socket_feedback_is_answered_with_an_error() {
    let rt = runtime(Arc::new(ScriptedAdapter::new()), test_config());
    let id = rt
        .orchestrator
        .start("alice", SessionInput::new("a paper boat"))
        .await
        .unwrap();
    rt.orchestrator.run_stage_with_pause(&id).await.unwrap();

    let (mut sink, mut stream) = rt.local_connector().connect(&id).await.unwrap();
    sink.send(&ChannelMessage::Feedback { content: "  ".into() })
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match stream.next_frame().await {
                Some(Ok(ChannelMessage::Heartbeat { .. })) => continue,
                other => return other,
            }
        }
    })
    .await
    .unwrap();
    match reply {
        Some(Ok(ChannelMessage::Error {
            code, recoverable, ..
        })) => {
            assert_eq!(code, "validation_error");
            assert!(recoverable);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_unrecoverable_failure_stops_the_client() {
    let rt = runtime(Arc::new(ScriptedAdapter::new()), test_config());
    let orch = rt.orchestrator.clone();
    let id = orch.start("alice", SessionInput::new("a glass city")).await.unwrap();
    orch.run_stage_with_pause(&id).await.unwrap();

    let client = ChannelClient::new(
        Arc::new(rt.local_connector()),
        Arc::new(orch.clone()),
        fast_policy(),
    );
    let (tx, mut rx) = mpsc::channel(64);
    let follower = {
        let id = id.clone();
        tokio::spawn(async move { client.run(&id, tx, CancellationToken::new()).await })
    };
    loop {
        match rx.recv().await {
            Some(ClientEvent::Resynced(session)) => {
                assert_eq!(session.state(), "story_paused");
                break;
            }
            Some(_) => {}
            None => panic!("client stopped before resync"),
        }
    }

    orch.fail(&id, ForgeError::internal("operator stop")).await.unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(5), follower)
        .await
        .unwrap()
        .unwrap();
    match exit {
        ClientExit::Failed(report) => {
            assert_eq!(report.code, "internal_error");
            assert!(!report.recoverable);
        }
        other => panic!("unexpected {:?}", other),
    }
}
