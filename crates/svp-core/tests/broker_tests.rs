//! End-to-end tests: a real broker on a loopback socket, driven through the
//! public client API.

use std::future::Future;
use std::time::Duration;
use svp_core::wire::{read_frame, write_frame};
use svp_core::{
    read_value, write_value, AccessPolicy, BrokerConfig, BrokerHandle, BrokerServer, ControlMask,
    Coupling, DatabaseFormat, EventListener, Notification, ProcessorIdentity, Signal, SvarKey,
    SvarState, SvpClient, SvpError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

const ALICE: ProcessorIdentity = ProcessorIdentity::top_level(1001);
const BOB: ProcessorIdentity = ProcessorIdentity::top_level(1002);
const CAROL: ProcessorIdentity = ProcessorIdentity::top_level(1003);

async fn start_broker() -> BrokerHandle {
    start_with(BrokerConfig::builder().tcp("127.0.0.1", 0)).await
}

async fn start_with(builder: svp_core::BrokerConfigBuilder) -> BrokerHandle {
    BrokerServer::start(builder.build().unwrap()).await.unwrap()
}

async fn client(handle: &BrokerHandle, identity: ProcessorIdentity) -> SvpClient {
    SvpClient::connect(handle.endpoint(), identity).await.unwrap()
}

async fn next_notification(listener: &mut EventListener) -> Notification {
    tokio::time::timeout(WAIT, listener.next())
        .await
        .expect("no notification in time")
        .unwrap()
        .expect("event channel closed")
}

/// Poll `check` until it yields true or `WAIT` runs out.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_offer_and_accept_couple_one_variable() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;
    let bob = client(&handle, BOB).await;
    let mut alice_events = EventListener::connect(handle.endpoint(), ALICE)
        .await
        .unwrap();
    let mut bob_events = EventListener::connect(handle.endpoint(), BOB).await.unwrap();

    let (key, coupling) = alice.match_or_make("DATA", BOB).await.unwrap();
    assert!(!key.is_null());
    assert_eq!(coupling, Coupling::Offered);

    match next_notification(&mut bob_events).await {
        Notification::OfferMade { key: offered, name, from } => {
            assert_eq!(offered, key);
            assert_eq!(name, "DATA");
            assert_eq!(from, ALICE);
        }
        other => panic!("unexpected {:?}", other),
    }

    let (accepted, coupling) = bob.match_or_make("DATA", ALICE).await.unwrap();
    assert_eq!(accepted, key);
    assert_eq!(coupling, Coupling::Coupled);

    assert_eq!(
        next_notification(&mut alice_events).await,
        Notification::OfferMatched { key, by: BOB }
    );

    assert_eq!(bob.get_varname(key).await.unwrap(), "DATA");
    assert_eq!(alice.get_coupling(key).await.unwrap(), Coupling::Coupled);
    assert_eq!(alice.get_state(key).await.unwrap(), SvarState::Idle);
    assert_eq!(bob.find_offering_id(key).await.unwrap(), Some(ALICE));
}

#[tokio::test]
async fn test_general_offer_accepted_by_any_processor() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;
    let carol = client(&handle, CAROL).await;

    let (key, coupling) = alice
        .match_or_make("PUBLIC", ProcessorIdentity::GENERAL)
        .await
        .unwrap();
    assert_eq!(coupling, Coupling::Offered);

    assert_eq!(carol.offering_processors(CAROL).await.unwrap(), vec![ALICE]);
    assert_eq!(
        carol.offered_variables(CAROL, ALICE).await.unwrap(),
        vec!["PUBLIC".to_string()]
    );

    let (accepted, coupling) = carol.match_or_make("PUBLIC", ALICE).await.unwrap();
    assert_eq!(accepted, key);
    assert_eq!(coupling, Coupling::Coupled);

    // once coupled the offer is no longer advertised
    assert!(carol.offering_processors(CAROL).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_value_travels_through_broker() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;
    let bob = client(&handle, BOB).await;

    let (key, _) = alice.match_or_make("V", BOB).await.unwrap();
    bob.match_or_make("V", ALICE).await.unwrap();

    let policy = AccessPolicy::default();
    write_value(&alice, key, b"hello".to_vec(), &policy)
        .await
        .unwrap();
    assert_eq!(bob.get_state(key).await.unwrap(), SvarState::OffererHasSet);
    assert!(bob.get_events(BOB).await.unwrap().is_some());

    let value = read_value(&bob, key, &policy).await.unwrap();
    assert_eq!(value, b"hello");
    assert_eq!(alice.get_state(key).await.unwrap(), SvarState::Idle);
}

#[tokio::test]
async fn test_control_blocks_second_set_until_partner_reads() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;
    let bob = client(&handle, BOB).await;

    let (key, _) = alice.match_or_make("GATED", BOB).await.unwrap();
    bob.match_or_make("GATED", ALICE).await.unwrap();

    let effective = alice
        .set_control(key, ControlMask::SET_BY_OFFERER)
        .await
        .unwrap();
    assert_eq!(effective, ControlMask::SET_BY_OFFERER);
    assert_eq!(bob.get_control(key).await.unwrap(), ControlMask::SET_BY_OFFERER);

    let policy = AccessPolicy::with_timeout(Duration::from_millis(300));
    write_value(&alice, key, b"1".to_vec(), &policy).await.unwrap();

    let err = write_value(&alice, key, b"2".to_vec(), &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, SvpError::AccessTimeout { .. }));

    assert_eq!(read_value(&bob, key, &policy).await.unwrap(), b"1");
    write_value(&alice, key, b"2".to_vec(), &policy).await.unwrap();
}

#[tokio::test]
async fn test_retract_notifies_partner() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;
    let bob = client(&handle, BOB).await;
    let mut bob_events = EventListener::connect(handle.endpoint(), BOB).await.unwrap();

    let (key, _) = alice.match_or_make("GONE", BOB).await.unwrap();
    let _ = next_notification(&mut bob_events).await;
    bob.match_or_make("GONE", ALICE).await.unwrap();

    assert_eq!(alice.retract(key).await.unwrap(), Coupling::Coupled);
    assert_eq!(
        next_notification(&mut bob_events).await,
        Notification::OfferRetracted { key, by: ALICE }
    );
    assert_eq!(bob.get_coupling(key).await.unwrap(), Coupling::Offered);
}

#[tokio::test]
async fn test_disconnect_releases_variables() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;
    let bob = client(&handle, BOB).await;
    let mut bob_events = EventListener::connect(handle.endpoint(), BOB).await.unwrap();

    let (key, _) = alice.match_or_make("SHARED", BOB).await.unwrap();
    let _ = next_notification(&mut bob_events).await;
    bob.match_or_make("SHARED", ALICE).await.unwrap();

    drop(alice);

    assert_eq!(
        next_notification(&mut bob_events).await,
        Notification::OfferRetracted { key, by: ALICE }
    );
    assert!(!bob.is_registered(ALICE).await.unwrap());
    assert_ne!(bob.get_coupling(key).await.unwrap(), Coupling::Coupled);
}

#[tokio::test]
async fn test_interpreter_exit_disconnects_its_processors() {
    let handle = start_broker().await;
    let interpreter = ProcessorIdentity::top_level(2001);
    let helper = ProcessorIdentity::new(42, 2001, 0);

    let parent = client(&handle, interpreter).await;
    let child = client(&handle, helper).await;
    let observer = client(&handle, CAROL).await;
    assert!(observer.is_registered(helper).await.unwrap());

    drop(parent);

    let observer = &observer;
    assert!(eventually(move || async move { !observer.is_registered(helper).await.unwrap() }).await);
    // the helper's own connection was closed by the broker
    assert!(child.is_registered(CAROL).await.is_err());
}

#[tokio::test]
async fn test_ap_exit_disconnects_its_children() {
    let handle = start_broker().await;
    let interpreter = ProcessorIdentity::top_level(2001);
    let helper = ProcessorIdentity::new(210, 2001, 0);
    let grandchild = ProcessorIdentity::new(100, 210, 2001);

    let parent = client(&handle, interpreter).await;
    let ap = client(&handle, helper).await;
    let _child = client(&handle, grandchild).await;
    assert!(parent.is_registered(grandchild).await.unwrap());

    drop(ap);

    let parent = &parent;
    assert!(
        eventually(move || async move { !parent.is_registered(grandchild).await.unwrap() }).await
    );
    assert!(parent.is_registered(interpreter).await.unwrap());
}

#[tokio::test]
async fn test_duplicate_registration_refused() {
    let handle = start_broker().await;
    let _alice = client(&handle, ALICE).await;

    let err = SvpClient::connect(handle.endpoint(), ALICE).await.unwrap_err();
    assert!(matches!(err, SvpError::AlreadyRegistered(id) if id == ALICE));
}

#[tokio::test]
async fn test_offer_as_someone_else_gets_null_key() {
    let handle = start_broker().await;
    let anonymous = SvpClient::connect_anonymous(handle.endpoint()).await.unwrap();

    // unregistered callers cannot offer
    let (key, coupling) = anonymous.match_or_make("X", BOB).await.unwrap();
    assert!(key.is_null());
    assert_eq!(coupling, Coupling::None);
}

#[tokio::test]
async fn test_full_table_refuses_new_offers() {
    let handle = start_with(BrokerConfig::builder().tcp("127.0.0.1", 0).max_variables(1)).await;
    let alice = client(&handle, ALICE).await;

    let (first, _) = alice.match_or_make("ONE", BOB).await.unwrap();
    assert!(!first.is_null());

    let (second, coupling) = alice.match_or_make("TWO", BOB).await.unwrap();
    assert_eq!(second, SvarKey::NULL);
    assert_eq!(coupling, Coupling::None);

    // retracting frees the slot
    alice.retract(first).await.unwrap();
    let (third, _) = alice.match_or_make("TWO", BOB).await.unwrap();
    assert!(!third.is_null());
}

#[tokio::test]
async fn test_unknown_record_is_remote_error() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;

    let err = alice.get_value(SvarKey(0xdead)).await.unwrap_err();
    assert!(matches!(err, SvpError::Remote { code, .. } if code == SvpError::CODE_UNKNOWN_KEY));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_unknown_kind_gets_error_reply() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;

    // a reply kind sent as a request is not something the broker serves
    let err = alice.call(Signal::YesNo { yes: true }).await.unwrap_err();
    assert!(matches!(err, SvpError::Remote { .. }));

    // the connection is still usable
    assert!(alice.is_registered(ALICE).await.unwrap());
}

#[tokio::test]
async fn test_truncated_frame_drops_only_that_connection() {
    let handle = start_with(
        BrokerConfig::builder()
            .tcp("127.0.0.1", 0)
            .frame_read_timeout(Duration::from_millis(200)),
    )
    .await;

    let mut raw = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();
    raw.write_all(&10u32.to_be_bytes()).await.unwrap();
    raw.write_all(&[0x01, 0x03, 0x00]).await.unwrap();

    let closed = tokio::time::timeout(WAIT, read_frame(&mut raw, WAIT))
        .await
        .expect("broker kept the stalled connection open");
    assert!(matches!(closed, Ok(None) | Err(_)));

    let alice = client(&handle, ALICE).await;
    assert!(alice.is_registered(ALICE).await.unwrap());
}

#[tokio::test]
async fn test_raw_frames_round_trip() {
    let handle = start_broker().await;
    let mut raw = TcpStream::connect(handle.local_addr().unwrap()).await.unwrap();

    let request = Signal::IsRegistered { identity: ALICE };
    write_frame(&mut raw, &request.encode().unwrap()).await.unwrap();
    let frame = read_frame(&mut raw, WAIT).await.unwrap().unwrap();
    assert_eq!(Signal::decode(&frame).unwrap(), Signal::YesNo { yes: false });
}

#[tokio::test]
async fn test_print_database_formats() {
    let handle = start_broker().await;
    let alice = client(&handle, ALICE).await;
    alice.match_or_make("LISTED", BOB).await.unwrap();

    let text = alice.print_database(DatabaseFormat::Text).await.unwrap();
    assert!(text.contains("LISTED"));

    let json = alice.print_database(DatabaseFormat::Json).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(json.contains("LISTED"));
    assert!(parsed.is_object());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_endpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("svp.sock");
    let handle = start_with(BrokerConfig::builder().unix(&path)).await;
    assert!(handle.port().is_none());

    let alice = client(&handle, ALICE).await;
    let bob = client(&handle, BOB).await;
    let (key, _) = alice.match_or_make("LOCAL", BOB).await.unwrap();
    let (same, _) = bob.match_or_make("LOCAL", ALICE).await.unwrap();
    assert_eq!(key, same);

    handle.join().await;
    assert!(!path.exists());
}
