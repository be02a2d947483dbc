//! End-to-end scenarios over real TCP: auth, chat fan-out, single-session
//! enforcement, offline store-and-forward, groups and history paging.

use parley_integration_tests::{wait_until_offline, TestClient, TestServer};
use parley_proto::{ErrorCode, WireMessage};

#[tokio::test]
async fn test_register_login_chat_fanout() {
    let server = TestServer::start().await;
    let public = server.public_group_id().await;

    let mut alice = TestClient::register(server.addr, "alice", "secret1").await;
    let mut bob = TestClient::register(server.addr, "bobby", "secret1").await;

    alice
        .send(&WireMessage::Chat {
            group_id: public,
            content: "hi".to_string(),
            sender_id: None,
            sender_username: None,
            timestamp: None,
            message_id: None,
        })
        .await;

    let received = bob
        .recv_where(|m| matches!(m, WireMessage::Chat { .. }))
        .await;
    match received {
        WireMessage::Chat {
            content,
            sender_username,
            sender_id,
            message_id,
            ..
        } => {
            assert_eq!(content, "hi");
            assert_eq!(sender_username.as_deref(), Some("alice"));
            assert!(sender_id.is_some());
            assert!(message_id.is_some());
        }
        other => panic!("unexpected frame: {}", other.type_name()),
    }
}

#[tokio::test]
async fn test_chat_requires_auth() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr).await;

    client
        .send(&WireMessage::Chat {
            group_id: 1,
            content: "sneaky".to_string(),
            sender_id: None,
            sender_username: None,
            timestamp: None,
            message_id: None,
        })
        .await;

    let err = client
        .recv_where(|m| matches!(m, WireMessage::Error { .. }))
        .await;
    assert!(matches!(
        err,
        WireMessage::Error {
            code: ErrorCode::AuthRequired,
            ..
        }
    ));
}

#[tokio::test]
async fn test_login_rejects_bad_credentials() {
    let server = TestServer::start().await;
    drop(TestClient::register(server.addr, "alice", "secret1").await);

    let (_client, response) = login_expect_error(server.addr, "alice", "wrong77").await;
    assert_invalid_credentials(&response);

    let (_client, response) = login_expect_error(server.addr, "nobody", "secret1").await;
    assert_invalid_credentials(&response);
}

/// A failed login surfaces as an error frame, never a partial
/// login_response.
async fn login_expect_error(
    addr: std::net::SocketAddr,
    username: &str,
    password: &str,
) -> (TestClient, WireMessage) {
    let mut client = TestClient::connect(addr).await;
    client
        .send(&WireMessage::Login {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await;
    let response = client
        .recv_where(|m| matches!(m, WireMessage::Error { .. } | WireMessage::LoginResponse { .. }))
        .await;
    (client, response)
}

fn assert_invalid_credentials(response: &WireMessage) {
    assert!(
        matches!(
            response,
            WireMessage::Error {
                code: ErrorCode::InvalidCredentials,
                ..
            }
        ),
        "expected INVALID_CREDENTIALS, got {response:?}"
    );
}

#[tokio::test]
async fn test_second_login_force_logs_out_first() {
    let server = TestServer::start().await;
    let mut first = TestClient::register(server.addr, "alice", "secret1").await;

    let (_second, response) = TestClient::login(server.addr, "alice", "secret1").await;
    assert!(matches!(
        response,
        WireMessage::LoginResponse { success: true, .. }
    ));

    let forced = first
        .recv_where(|m| matches!(m, WireMessage::ForceLogout { .. }))
        .await;
    assert!(matches!(forced, WireMessage::ForceLogout { .. }));
    assert!(first.closed().await, "old connection must be closed");
}

#[tokio::test]
async fn test_offline_store_and_forward() {
    let server = TestServer::start().await;

    let bob_id = {
        let bob = TestClient::register(server.addr, "bobby", "secret1").await;
        let id = server
            .ctx
            .store
            .get_user_by_name("bobby")
            .await
            .unwrap()
            .unwrap()
            .id;
        drop(bob);
        id
    };
    wait_until_offline(&server.ctx, bob_id).await;

    let mut alice = TestClient::register(server.addr, "alice", "secret1").await;
    alice
        .send(&WireMessage::Private {
            target_user: Some("bobby".to_string()),
            content: "psst, you there?".to_string(),
            sender_id: None,
            sender_username: None,
            timestamp: None,
            message_id: None,
        })
        .await;

    // Give the router a moment to persist the miss.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let (mut bob, response) = TestClient::login(server.addr, "bobby", "secret1").await;
    let WireMessage::LoginResponse {
        success: true,
        offline_count,
        ..
    } = response
    else {
        panic!("login failed: {response:?}");
    };
    assert_eq!(offline_count, 1);

    let delivered = bob
        .recv_where(|m| matches!(m, WireMessage::Private { .. }))
        .await;
    match delivered {
        WireMessage::Private {
            content,
            sender_username,
            ..
        } => {
            assert_eq!(content, "psst, you there?");
            assert_eq!(sender_username.as_deref(), Some("alice"));
        }
        other => panic!("unexpected frame: {}", other.type_name()),
    }

    // Exactly once: a second login replays nothing.
    drop(bob);
    wait_until_offline(&server.ctx, bob_id).await;
    let (_bob, response) = TestClient::login(server.addr, "bobby", "secret1").await;
    let WireMessage::LoginResponse { offline_count, .. } = response else {
        panic!("login failed");
    };
    assert_eq!(offline_count, 0);
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send(&WireMessage::Ping { timestamp: 12345 }).await;
    let pong = client
        .recv_where(|m| matches!(m, WireMessage::Pong { .. }))
        .await;
    assert_eq!(pong, WireMessage::Pong { timestamp: 12345 });
}

#[tokio::test]
async fn test_group_create_join_chat_leave() {
    let server = TestServer::start().await;
    let mut alice = TestClient::register(server.addr, "alice", "secret1").await;
    let mut bob = TestClient::register(server.addr, "bobby", "secret1").await;

    alice
        .send(&WireMessage::CreateGroup {
            name: "dev".to_string(),
            is_private: false,
            members: vec![],
        })
        .await;
    let created = alice
        .recv_where(|m| matches!(m, WireMessage::GroupResponse { .. }))
        .await;
    let WireMessage::GroupResponse {
        success: true,
        group_id: Some(dev),
        ..
    } = created
    else {
        panic!("group creation failed: {created:?}");
    };

    bob.send(&WireMessage::JoinGroup {
        group_id: None,
        name: Some("dev".to_string()),
    })
    .await;
    let joined = bob
        .recv_where(|m| matches!(m, WireMessage::GroupResponse { .. }))
        .await;
    assert!(matches!(
        joined,
        WireMessage::GroupResponse { success: true, .. }
    ));

    alice
        .send(&WireMessage::Chat {
            group_id: dev,
            content: "welcome to dev".to_string(),
            sender_id: None,
            sender_username: None,
            timestamp: None,
            message_id: None,
        })
        .await;
    let received = bob
        .recv_where(|m| matches!(m, WireMessage::Chat { .. }))
        .await;
    assert!(matches!(
        received,
        WireMessage::Chat { ref content, .. } if content == "welcome to dev"
    ));

    bob.send(&WireMessage::LeaveGroup { group_id: dev }).await;
    let left = bob
        .recv_where(|m| matches!(m, WireMessage::GroupResponse { .. }))
        .await;
    assert!(matches!(
        left,
        WireMessage::GroupResponse { success: true, .. }
    ));

    // Chatting in a group bob left fails.
    bob.send(&WireMessage::Chat {
        group_id: dev,
        content: "still here?".to_string(),
        sender_id: None,
        sender_username: None,
        timestamp: None,
        message_id: None,
    })
    .await;
    let err = bob
        .recv_where(|m| matches!(m, WireMessage::Error { .. }))
        .await;
    assert!(matches!(
        err,
        WireMessage::Error {
            code: ErrorCode::NotAMember,
            ..
        }
    ));
}

#[tokio::test]
async fn test_history_paging() {
    let server = TestServer::start().await;
    let public = server.public_group_id().await;
    let mut alice = TestClient::register(server.addr, "alice", "secret1").await;

    for i in 0..5 {
        alice
            .send(&WireMessage::Chat {
                group_id: public,
                content: format!("msg {i}"),
                sender_id: None,
                sender_username: None,
                timestamp: None,
                message_id: None,
            })
            .await;
    }

    // Wait until all five are persisted before paging.
    let deadline = tokio::time::Instant::now() + parley_integration_tests::RECV_TIMEOUT;
    loop {
        let (rows, _) = server
            .ctx
            .store
            .get_history(public, 100, None)
            .await
            .unwrap();
        if rows.len() >= 5 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "messages never persisted"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    alice
        .send(&WireMessage::HistoryRequest {
            group_id: public,
            limit: Some(3),
            before_id: None,
        })
        .await;

    let response = alice
        .recv_where(|m| matches!(m, WireMessage::HistoryResponse { .. }))
        .await;
    let WireMessage::HistoryResponse {
        messages, has_more, ..
    } = response
    else {
        unreachable!();
    };

    assert!(has_more);
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "msg 2");
    assert_eq!(messages[2].content, "msg 4");
    assert!(messages
        .windows(2)
        .all(|w| w[0].message_id < w[1].message_id));

    // Page older messages.
    alice
        .send(&WireMessage::HistoryRequest {
            group_id: public,
            limit: Some(3),
            before_id: Some(messages[0].message_id),
        })
        .await;
    let response = alice
        .recv_where(|m| matches!(m, WireMessage::HistoryResponse { .. }))
        .await;
    let WireMessage::HistoryResponse {
        messages, has_more, ..
    } = response
    else {
        unreachable!();
    };
    assert!(!has_more);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "msg 0");
}

#[tokio::test]
async fn test_private_chat_group_flow() {
    let server = TestServer::start().await;
    let mut alice = TestClient::register(server.addr, "alice", "secret1").await;
    let mut bob = TestClient::register(server.addr, "bobby", "secret1").await;

    alice
        .send(&WireMessage::CreateGroup {
            name: "alice-bobby".to_string(),
            is_private: true,
            members: vec!["bobby".to_string()],
        })
        .await;
    let created = alice
        .recv_where(|m| matches!(m, WireMessage::GroupResponse { .. }))
        .await;
    let WireMessage::GroupResponse {
        success: true,
        group_id: Some(dm),
        ..
    } = created
    else {
        panic!("private chat creation failed: {created:?}");
    };

    // Same code path as any group.
    alice
        .send(&WireMessage::Chat {
            group_id: dm,
            content: "just us".to_string(),
            sender_id: None,
            sender_username: None,
            timestamp: None,
            message_id: None,
        })
        .await;
    let received = bob
        .recv_where(|m| matches!(m, WireMessage::Chat { .. }))
        .await;
    assert!(matches!(
        received,
        WireMessage::Chat { ref content, .. } if content == "just us"
    ));
}

#[tokio::test]
async fn test_oversize_message_rejected() {
    let server = TestServer::start().await;
    let public = server.public_group_id().await;
    let mut alice = TestClient::register(server.addr, "alice", "secret1").await;

    alice
        .send(&WireMessage::Chat {
            group_id: public,
            content: "x".repeat(2001),
            sender_id: None,
            sender_username: None,
            timestamp: None,
            message_id: None,
        })
        .await;

    let err = alice
        .recv_where(|m| matches!(m, WireMessage::Error { .. }))
        .await;
    assert!(matches!(
        err,
        WireMessage::Error {
            code: ErrorCode::MessageTooLong,
            ..
        }
    ));
}
