//! Message-data loopback scenarios: full Notify/Request/Reply/Confirm
//! exchanges between two sessions.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use trdp::{
    ErrorKind, ListenerParams, MdHandle, MsgType, NotifyParams, RequestParams, Session,
    SessionConfig, TelegramFlags,
};

fn loopback_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.interface.host_ip = Ipv4Addr::LOCALHOST;
    config.pd.port = 0;
    config.md.udp_port = 0;
    config.md.tcp_port = 0;
    config
}

fn open(config: SessionConfig) -> Session {
    Session::open_with_logger(config, &keel::logging::discard()).unwrap()
}

fn md_udp_dest(session: &Session) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, session.md_udp_port()))
}

fn md_tcp_dest(session: &Session) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, session.md_tcp_port()))
}

fn tick_both(a: &mut Session, b: &mut Session) {
    a.process(Instant::now()).unwrap();
    b.process(Instant::now()).unwrap();
    std::thread::sleep(Duration::from_millis(5));
}

fn request_params(dest: SocketAddr) -> RequestParams {
    RequestParams {
        com_id: 5000,
        dest,
        dest_uri: "replier.car1".to_string(),
        expected_replies: 1,
        reply_timeout: Duration::from_millis(800),
        confirm_timeout: Duration::from_millis(800),
        retries: Some(0),
        flags: TelegramFlags::default(),
    }
}

#[test]
fn notify_reaches_listener() {
    let mut caller = open(loopback_config());
    let mut replier = open(loopback_config());

    let payloads = Arc::new(Mutex::new(Vec::new()));
    let payloads_cb = payloads.clone();
    replier
        .add_listener(
            ListenerParams { com_id: 4000, uri: String::new() },
            Box::new(move |event| {
                assert_eq!(event.msg_type, MsgType::Mn);
                payloads_cb.lock().unwrap().push(event.copy_payload());
            }),
        )
        .unwrap();

    caller
        .send_notify(
            NotifyParams {
                com_id: 4000,
                dest: md_udp_dest(&replier),
                dest_uri: String::new(),
                flags: TelegramFlags::default(),
            },
            b"door closed",
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && payloads.lock().unwrap().is_empty() {
        tick_both(&mut caller, &mut replier);
    }
    assert_eq!(payloads.lock().unwrap().as_slice(), &[b"door closed".to_vec()]);
}

/// Request -> Mq -> Confirm: both sessions complete, the caller sees the
/// reply payload, the replier sees the confirmation.
#[test]
fn request_reply_confirm_completes_both_sides() {
    let mut caller = open(loopback_config());
    let mut replier = open(loopback_config());

    // Replier answers every request with a confirmable reply.
    let pending: Arc<Mutex<Vec<MdHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let pending_cb = pending.clone();
    let replier_terminals = Arc::new(Mutex::new(Vec::new()));
    let replier_terminals_cb = replier_terminals.clone();
    replier
        .add_listener(
            ListenerParams { com_id: 5000, uri: "replier.car1".to_string() },
            Box::new(move |event| {
                if event.needs_reply {
                    assert_eq!(event.payload, b"status?");
                    pending_cb.lock().unwrap().push(event.session);
                }
                if event.terminal {
                    replier_terminals_cb.lock().unwrap().push((event.msg_type, event.status));
                }
            }),
        )
        .unwrap();

    let caller_events = Arc::new(Mutex::new(Vec::new()));
    let caller_events_cb = caller_events.clone();
    let handle = caller
        .send_request(
            request_params(md_udp_dest(&replier)),
            b"status?",
            Box::new(move |event| {
                caller_events_cb.lock().unwrap().push((
                    event.msg_type,
                    event.status,
                    event.needs_confirm,
                    event.terminal,
                    event.copy_payload(),
                ));
            }),
        )
        .unwrap();

    // Wait for the request to land.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && pending.lock().unwrap().is_empty() {
        tick_both(&mut caller, &mut replier);
    }
    let replier_session = pending.lock().unwrap()[0];

    replier.send_reply_query(replier_session, 5001, b"all doors closed").unwrap();

    // Wait for the reply at the caller.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && caller_events.lock().unwrap().is_empty() {
        tick_both(&mut caller, &mut replier);
    }
    {
        let events = caller_events.lock().unwrap();
        let (msg_type, status, needs_confirm, terminal, payload) = &events[0];
        assert_eq!(*msg_type, MsgType::Mq);
        assert_eq!(*status, ErrorKind::NoError);
        assert!(*needs_confirm);
        assert!(!*terminal);
        assert_eq!(payload, b"all doors closed");
    }

    caller.send_confirm(handle).unwrap();

    // Wait for the confirmation to complete the replier.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && replier_terminals.lock().unwrap().is_empty() {
        tick_both(&mut caller, &mut replier);
    }
    assert_eq!(
        replier_terminals.lock().unwrap().as_slice(),
        &[(MsgType::Mc, ErrorKind::NoError)]
    );

    // The caller delivered its terminal exactly once.
    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        tick_both(&mut caller, &mut replier);
    }
    let events = caller_events.lock().unwrap();
    let terminals: Vec<_> = events.iter().filter(|e| e.3).collect();
    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].1, ErrorKind::NoError);
}

/// Same exchange, but the caller never confirms: the replier's confirm
/// timer emits "Me" with ConfirmTimeout and both sessions fail.
#[test]
fn missing_confirm_fails_both_sides() {
    let mut replier_config = loopback_config();
    replier_config.md.confirm_timeout_us = 150_000;
    let mut caller = open(loopback_config());
    let mut replier = open(replier_config);

    let pending: Arc<Mutex<Vec<MdHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let pending_cb = pending.clone();
    let replier_terminals = Arc::new(Mutex::new(Vec::new()));
    let replier_terminals_cb = replier_terminals.clone();
    replier
        .add_listener(
            ListenerParams { com_id: 5000, uri: String::new() },
            Box::new(move |event| {
                if event.needs_reply {
                    pending_cb.lock().unwrap().push(event.session);
                }
                if event.terminal {
                    replier_terminals_cb.lock().unwrap().push(event.status);
                }
            }),
        )
        .unwrap();

    let caller_terminals = Arc::new(Mutex::new(Vec::new()));
    let caller_terminals_cb = caller_terminals.clone();
    caller
        .send_request(
            request_params(md_udp_dest(&replier)),
            b"status?",
            Box::new(move |event| {
                if event.terminal {
                    caller_terminals_cb.lock().unwrap().push(event.status);
                }
            }),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && pending.lock().unwrap().is_empty() {
        tick_both(&mut caller, &mut replier);
    }
    let replier_session = pending.lock().unwrap()[0];
    replier.send_reply_query(replier_session, 0, b"answer").unwrap();

    // Nobody confirms. The replier times out, sends "Me", both fail.
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline
        && (replier_terminals.lock().unwrap().is_empty()
            || caller_terminals.lock().unwrap().is_empty())
    {
        tick_both(&mut caller, &mut replier);
    }

    assert_eq!(replier_terminals.lock().unwrap().as_slice(), &[ErrorKind::ConfirmTimeout]);
    assert_eq!(caller_terminals.lock().unwrap().as_slice(), &[ErrorKind::ConfirmTimeout]);
    assert_eq!(replier.statistics().md.confirm_timeouts, 1);
}

/// Request without a replier: retries go out, then the caller fails with
/// `Timeout`.
#[test]
fn unanswered_request_times_out_after_retries() {
    let mut caller = open(loopback_config());

    let terminals = Arc::new(Mutex::new(Vec::new()));
    let terminals_cb = terminals.clone();
    let mut params = request_params("127.0.0.1:9".parse().unwrap());
    params.reply_timeout = Duration::from_millis(350);
    params.retries = Some(2);
    caller
        .send_request(
            params,
            b"anyone?",
            Box::new(move |event| {
                if event.terminal {
                    terminals_cb.lock().unwrap().push(event.status);
                }
            }),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && terminals.lock().unwrap().is_empty() {
        caller.process(Instant::now()).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(terminals.lock().unwrap().as_slice(), &[ErrorKind::Timeout]);
    let stats = caller.statistics();
    assert_eq!(stats.md.retries, 2);
    assert_eq!(stats.md.reply_timeouts, 1);
}

/// The same request/reply exchange over the TCP connection pool.
#[test]
fn tcp_request_reply_roundtrip() {
    let mut caller = open(loopback_config());
    let mut replier = open(loopback_config());

    let pending: Arc<Mutex<Vec<MdHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let pending_cb = pending.clone();
    replier
        .add_listener(
            ListenerParams { com_id: 5200, uri: String::new() },
            Box::new(move |event| {
                if event.needs_reply {
                    assert_eq!(event.payload, b"over tcp");
                    pending_cb.lock().unwrap().push(event.session);
                }
            }),
        )
        .unwrap();

    let replies = Arc::new(AtomicUsize::new(0));
    let replies_cb = replies.clone();
    let mut params = request_params(md_tcp_dest(&replier));
    params.com_id = 5200;
    params.reply_timeout = Duration::from_secs(2);
    params.flags = TelegramFlags { tcp: true, ..Default::default() };
    caller
        .send_request(
            params,
            b"over tcp",
            Box::new(move |event| {
                if event.terminal && event.status == ErrorKind::NoError {
                    assert_eq!(event.payload, b"tcp answer");
                    replies_cb.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

    // Drive until the request lands (connect + frame + dispatch).
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && pending.lock().unwrap().is_empty() {
        tick_both(&mut caller, &mut replier);
    }
    assert!(!pending.lock().unwrap().is_empty(), "request never arrived over TCP");
    let replier_session = pending.lock().unwrap()[0];

    replier.send_reply(replier_session, 0, b"tcp answer").unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && replies.load(Ordering::SeqCst) == 0 {
        tick_both(&mut caller, &mut replier);
    }
    assert_eq!(replies.load(Ordering::SeqCst), 1);
}
