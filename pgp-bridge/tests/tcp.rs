#![cfg(feature = "tcp")]

use std::{collections::VecDeque, time::Duration};

use pgp_bridge::{
    config::KeyConfiguration,
    provider::{
        tcp::{ProviderRequest, ProviderResponse, TcpHandler},
        TcpProvider,
    },
    request::ActionDescriptor,
    Action, BridgeEvent, Error, ModalResult, OperationRequest, PgpBridge, RawReply,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    sync::mpsc::{self, UnboundedReceiver},
    time::timeout,
};

static HOST: &str = "127.0.0.1";
static SERVICE_ID: &str = "com.example.pgp";

enum Answer {
    Reply(RawReply),
    Garbage,
    Hangup,
}

/// Spawns a provider daemon answering calls with the given answers,
/// in order. Returns its port and the calls it received.
async fn spawn_daemon(answers: Vec<Answer>) -> (u16, UnboundedReceiver<(ActionDescriptor, Vec<u8>)>) {
    let listener = TcpListener::bind((HOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (calls_tx, calls_rx) = mpsc::unbounded_channel();
    let mut answers = VecDeque::from(answers);

    tokio::spawn(async move {
        let mut sessions = 0;

        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let mut handler = TcpHandler::from(stream);

            let res = match handler.read().await.unwrap() {
                ProviderRequest::Bind { service_id } if service_id == SERVICE_ID => {
                    sessions += 1;
                    ProviderResponse::Bound { session: sessions }
                }
                ProviderRequest::Bind { service_id } => ProviderResponse::Refused {
                    reason: format!("unknown service {service_id}"),
                },
                ProviderRequest::Call {
                    descriptor, input, ..
                } => {
                    let _ = calls_tx.send((descriptor, input));

                    match answers.pop_front() {
                        Some(Answer::Reply(reply)) => ProviderResponse::Reply { reply },
                        Some(Answer::Garbage) => {
                            handler.writer.write_all(b"garbage\n").await.unwrap();
                            continue;
                        }
                        Some(Answer::Hangup) | None => continue,
                    }
                }
                ProviderRequest::Unbind { .. } => ProviderResponse::Unbound,
            };

            handler.write(&res).await.unwrap();
        }
    });

    (port, calls_rx)
}

async fn connect(port: u16, service_id: &str) -> (PgpBridge, UnboundedReceiver<BridgeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = KeyConfiguration::new(service_id, "alice");

    let bridge = PgpBridge::builder(TcpProvider::new(HOST, port), config)
        .with_handler(move |event| {
            let _ = tx.send(event);
            async { Ok(()) }
        })
        .build()
        .unwrap();

    (bridge, rx)
}

fn encrypt_request() -> OperationRequest {
    OperationRequest::builder(Action::Encrypt)
        .with_recipient("alice@example.com")
        .with_payload("hello, world")
        .build()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn encrypt_over_tcp() {
    let armored = "-----BEGIN PGP MESSAGE-----\n...\n-----END PGP MESSAGE-----\n";
    let (port, mut calls) = spawn_daemon(vec![
        Answer::Reply(RawReply::interaction_required(b"t1".to_vec(), "unlock-key")),
        Answer::Reply(RawReply::success(armored)),
    ])
    .await;

    let (bridge, mut events) = connect(port, SERVICE_ID).await;
    bridge.connect().await.unwrap();
    assert!(bridge.is_ready());

    let op = bridge.submit(encrypt_request());

    let code = loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(BridgeEvent::LaunchInteraction {
                request_code,
                interaction,
            }) => {
                assert_eq!(interaction.as_bytes(), b"unlock-key");
                break request_code;
            }
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    };

    bridge.on_modal_result(ModalResult::ok(code)).unwrap();
    assert_eq!(op.await.unwrap(), armored.as_bytes());

    let (first, input) = calls.recv().await.unwrap();
    assert_eq!(first.action, Action::Encrypt);
    assert_eq!(first.recipients, ["alice@example.com"]);
    assert!(first.ascii_armor);
    assert_eq!(first.continuation, None);
    assert_eq!(input, b"hello, world");

    let (retry, _) = calls.recv().await.unwrap();
    assert_eq!(
        retry.continuation.map(Vec::<u8>::from),
        Some(b"t1".to_vec())
    );

    bridge.disconnect().await.unwrap();
    assert!(!bridge.is_ready());
}

#[test_log::test(tokio::test)]
async fn bind_refused_over_tcp() {
    let (port, _calls) = spawn_daemon(Vec::new()).await;
    let (bridge, _events) = connect(port, "com.example.unknown").await;

    match bridge.connect().await.unwrap_err() {
        Error::BindProviderError(err, service) => {
            assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
            assert_eq!(service, "com.example.unknown");
        }
        err => panic!("unexpected error: {err:?}"),
    }

    assert!(!bridge.is_ready());
}

#[test_log::test(tokio::test)]
async fn garbage_reply_over_tcp() {
    let (port, _calls) = spawn_daemon(vec![Answer::Garbage]).await;
    let (bridge, _events) = connect(port, SERVICE_ID).await;
    bridge.connect().await.unwrap();

    let err = bridge.submit(encrypt_request()).await.unwrap_err();
    assert!(matches!(err, Error::MalformedReplyError(_)), "{err:?}");
}

#[test_log::test(tokio::test)]
async fn daemon_hangs_up_over_tcp() {
    let (port, _calls) = spawn_daemon(vec![Answer::Hangup]).await;
    let (bridge, _events) = connect(port, SERVICE_ID).await;
    bridge.connect().await.unwrap();

    let err = bridge.submit(encrypt_request()).await.unwrap_err();
    assert!(matches!(err, Error::ProviderDiedError(_)), "{err:?}");
}
