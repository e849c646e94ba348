//! End-to-end session scenarios driving the server engine with literal wire
//! bytes, plus client↔server loopbacks in plain and hidden modes.

use s4pp_engine::crypto::{HashAlg, HideAlg, derive_session_key, hmac_once};
use s4pp_engine::hide::HideEncrypt;
use s4pp_engine::server::{ServerConfig, ServerSession};
use s4pp_engine::{ClientConfig, ClientEvent, ClientSession, SessionError};
use s4pp_test_utils::{MemoryKeyStore, RecordingSink, ScriptedEntropy, SinkCall};

const TOKEN_HEX: &str = "f8763c330bf5ed2feafaf56c484649bf";
const KEYID: &str = "1234";
const KEY: &[u8] = b"secret";

fn token_raw() -> Vec<u8> {
    hex::decode(TOKEN_HEX).unwrap()
}

fn server_config(hide: bool) -> ServerConfig {
    ServerConfig {
        hide_algos: if hide {
            vec![HideAlg::Aes128Cbc]
        } else {
            Vec::new()
        },
        ..ServerConfig::default()
    }
}

fn new_server(hide: bool) -> ServerSession<MemoryKeyStore, RecordingSink> {
    let keys = MemoryKeyStore::new().with_key(KEYID, KEY);
    let mut entropy = ScriptedEntropy::new(&[TOKEN_HEX]);
    ServerSession::new(server_config(hide), keys, RecordingSink::new(), &mut entropy).unwrap()
}

fn auth_line() -> String {
    let proof = hmac_once(HashAlg::Sha256, KEY, &[KEYID.as_bytes(), TOKEN_HEX.as_bytes()]);
    format!("AUTH:SHA256,{},{}\n", KEYID, hex::encode(proof))
}

fn sig_line(body: &str) -> String {
    let digest = hmac_once(HashAlg::Sha256, KEY, &[&token_raw(), body.as_bytes()]);
    format!("SIG:{}\n", hex::encode(digest))
}

// ---------------------------------------------------------------------------
// Seed scenarios
// ---------------------------------------------------------------------------

#[test]
fn minimal_happy_path() {
    let mut server = new_server(false);
    let greeting = server.take_output();
    assert_eq!(
        greeting,
        format!("S4PP/1.2 SHA256 2000 -\nTOK:{TOKEN_HEX}\n").into_bytes()
    );

    // The whole upload is pipelined into a single receive call.
    let body = "SEQ:0,1513833032,1,0\nDICT:0,C,100,temperature\n0,0,2561\n";
    let upload = format!("{}{}{}", auth_line(), body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();

    assert_eq!(server.take_output(), b"OK:0\n".to_vec());
    assert_eq!(server.authenticated_keyid(), Some(KEYID));
    assert_eq!(server.last_committed(), Some(0));

    let samples = server.sink().committed_samples(0);
    assert_eq!(samples.len(), 1);
    let sample = &samples[0];
    assert_eq!(sample.seqid, 0);
    assert_eq!(sample.idx, 0);
    assert_eq!(sample.name, "temperature");
    assert_eq!(sample.unit, "C");
    assert_eq!(sample.unit_divisor, 100);
    assert_eq!((sample.time_num, sample.time_div), (1_513_833_032, 1));
    assert_eq!(sample.span, 0);
    assert_eq!(sample.values, vec!["2561".to_owned()]);
}

#[test]
fn bad_signature_aborts_without_samples() {
    let mut server = new_server(false);
    server.take_output();

    let body = "SEQ:0,1513833032,1,0\nDICT:0,C,100,temperature\n0,0,2561\n";
    let mut sig = sig_line(body);
    // Flip one hex digit of the signature.
    let flipped = if sig.as_bytes()[4] == b'0' { '1' } else { '0' };
    sig.replace_range(4..5, &flipped.to_string());

    let upload = format!("{}{}{}", auth_line(), body, sig);
    server.receive(upload.as_bytes()).unwrap();

    assert_eq!(server.take_output(), b"REJ:bad signature\n".to_vec());
    assert!(server.sink().committed_seqids().is_empty());
    assert_eq!(server.sink().aborted_seqids(), vec![0]);
    assert!(!server.is_closed());
}

#[test]
fn non_monotonic_seqid_is_rejected_and_session_survives() {
    let mut server = new_server(false);
    server.take_output();

    let body = "SEQ:0,1513833032,1,0\nDICT:0,C,100,temperature\n0,0,2561\n";
    let upload = format!("{}{}{}", auth_line(), body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.take_output(), b"OK:0\n".to_vec());

    // Replaying seqid 0 is rejected by id, without opening a sequence.
    server.receive(b"SEQ:0,1513833032,1,0\n").unwrap();
    assert_eq!(server.take_output(), b"REJ:0\n".to_vec());
    assert!(!server.is_closed());

    // The session remains usable for the next id.
    let body = "SEQ:1,1513833100,1,0\nDICT:0,C,100,temperature\n0,0,2600\n";
    let upload = format!("{}{}", body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.take_output(), b"OK:1\n".to_vec());
    assert_eq!(server.sink().committed_seqids(), vec![0, 1]);
}

#[test]
fn hidden_upload_round_trip() {
    let mut server = new_server(true);
    let greeting = server.take_output();
    assert_eq!(
        greeting,
        format!("S4PP/1.2 SHA256 2000 AES-128-CBC\nTOK:{TOKEN_HEX}\n").into_bytes()
    );

    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"HIDE:AES-128-CBC\n").unwrap();

    let session_key = derive_session_key(HideAlg::Aes128Cbc, KEY, &token_raw());
    let mut enc = HideEncrypt::new(HideAlg::Aes128Cbc, &session_key);
    let mut wire = Vec::new();
    // Salt line first, then the same upload as the plain happy path.
    enc.feed(b"8b1d4f22c09a5e7d31c6a8f00e55b2d1\n", &mut wire);
    let body = "SEQ:0,1513833032,1,0\nDICT:0,C,100,temperature\n0,0,2561\n";
    enc.feed(body.as_bytes(), &mut wire);
    enc.feed(sig_line(body).as_bytes(), &mut wire);
    enc.flush(&mut wire);

    server.receive(&wire).unwrap();
    assert_eq!(server.take_output(), b"OK:0\n".to_vec());
    assert_eq!(server.sink().committed_samples(0).len(), 1);
}

#[test]
fn crlf_framing_is_rejected() {
    let mut server = new_server(false);
    server.take_output();

    let mut auth = auth_line();
    auth.insert(auth.len() - 1, '\r');
    let err = server.receive(auth.as_bytes()).unwrap_err();
    assert!(matches!(err, SessionError::Framing(_)));
    assert_eq!(server.take_output(), b"REJ:malformed\n".to_vec());
    assert!(server.is_closed());
}

#[test]
fn dictionary_redefinition_within_a_sequence() {
    let mut server = new_server(false);
    server.take_output();

    let body = "SEQ:0,100,1,0\nDICT:0,C,100,temp\nDICT:0,K,1,kelvin\n0,0,300\n";
    let upload = format!("{}{}{}", auth_line(), body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.take_output(), b"OK:0\n".to_vec());

    let samples = server.sink().committed_samples(0);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].unit, "K");
    assert_eq!(samples[0].unit_divisor, 1);
    assert_eq!(samples[0].name, "kelvin");
}

// ---------------------------------------------------------------------------
// Further server properties
// ---------------------------------------------------------------------------

#[test]
fn dictionary_scope_ends_with_the_sequence() {
    let mut server = new_server(false);
    server.take_output();

    let body = "SEQ:0,100,1,0\nDICT:0,C,100,temperature\n0,0,1\n";
    let upload = format!("{}{}{}", auth_line(), body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.take_output(), b"OK:0\n".to_vec());

    // Index 0 is gone in the next sequence until redefined.
    server.receive(b"SEQ:1,200,1,0\n0,0,1\n").unwrap();
    assert_eq!(server.take_output(), b"REJ:1\n".to_vec());
    assert_eq!(server.sink().aborted_seqids(), vec![1]);
    assert!(!server.is_closed());
}

#[test]
fn wrong_auth_proof_closes_the_session() {
    let mut server = new_server(false);
    server.take_output();

    let err = server
        .receive(b"AUTH:SHA256,1234,00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff\n")
        .unwrap_err();
    assert_eq!(err, SessionError::AuthFailed);
    assert_eq!(server.take_output(), b"REJ:auth\n".to_vec());
    assert!(server.is_closed());
}

#[test]
fn unknown_keyid_closes_the_session() {
    let mut server = new_server(false);
    server.take_output();
    let proof = hmac_once(HashAlg::Sha256, KEY, &[b"9999", TOKEN_HEX.as_bytes()]);
    let line = format!("AUTH:SHA256,9999,{}\n", hex::encode(proof));
    assert_eq!(
        server.receive(line.as_bytes()).unwrap_err(),
        SessionError::AuthFailed
    );
}

#[test]
fn no_common_hash_terminates_without_reject() {
    let mut server = new_server(false);
    server.take_output();
    let err = server.receive(b"S4PP/1.2 MD5 -\n").unwrap_err();
    assert_eq!(err, SessionError::NoCommonHash);
    assert!(server.take_output().is_empty());
    assert!(server.is_closed());
}

#[test]
fn client_hello_then_auth() {
    let mut server = new_server(false);
    server.take_output();
    let upload = format!("S4PP/1.2 SHA256 -\n{}", auth_line());
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.authenticated_keyid(), Some(KEYID));
}

#[test]
fn zero_time_divisor_is_rejected() {
    let mut server = new_server(false);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"SEQ:0,100,0,0\n").unwrap();
    assert_eq!(server.take_output(), b"REJ:0\n".to_vec());
    assert!(!server.is_closed());
}

#[test]
fn unknown_data_format_is_rejected() {
    let mut server = new_server(false);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"SEQ:0,100,1,7\n").unwrap();
    assert_eq!(server.take_output(), b"REJ:0\n".to_vec());
}

#[test]
fn hide_before_auth_is_fatal() {
    let mut server = new_server(true);
    server.take_output();
    let err = server.receive(b"HIDE:AES-128-CBC\n").unwrap_err();
    assert_eq!(err, SessionError::UnexpectedCommand);
    assert_eq!(server.take_output(), b"REJ:unexpected\n".to_vec());
}

#[test]
fn second_hide_is_rejected() {
    let mut server = new_server(true);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"HIDE:AES-128-CBC\n").unwrap();

    let session_key = derive_session_key(HideAlg::Aes128Cbc, KEY, &token_raw());
    let mut enc = HideEncrypt::new(HideAlg::Aes128Cbc, &session_key);
    let mut wire = Vec::new();
    enc.feed(b"saltsaltsalt\n", &mut wire);
    enc.feed(b"HIDE:AES-128-CBC\n", &mut wire);
    enc.flush(&mut wire);
    server.receive(&wire).unwrap();
    assert_eq!(server.take_output(), b"REJ:hide\n".to_vec());
    assert!(!server.is_closed());
}

#[test]
fn hide_with_unknown_cipher_is_rejected() {
    let mut server = new_server(true);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"HIDE:DES-CBC\n").unwrap();
    assert_eq!(server.take_output(), b"REJ:hide\n".to_vec());
    assert!(!server.is_closed());
}

#[test]
fn hide_inside_a_sequence_aborts_it() {
    let mut server = new_server(true);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"SEQ:0,100,1,0\nHIDE:AES-128-CBC\n").unwrap();
    assert_eq!(server.take_output(), b"REJ:hide\n".to_vec());
    assert_eq!(server.sink().aborted_seqids(), vec![0]);
    assert!(!server.is_closed());
}

#[test]
fn empty_salt_after_hide_has_no_side_effects() {
    let mut server = new_server(true);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"HIDE:AES-128-CBC\n").unwrap();

    let session_key = derive_session_key(HideAlg::Aes128Cbc, KEY, &token_raw());
    let mut enc = HideEncrypt::new(HideAlg::Aes128Cbc, &session_key);

    // A zero-length salt line: one LF, padded out to a whole block of LFs.
    let mut wire = Vec::new();
    enc.feed(b"\n", &mut wire);
    enc.flush(&mut wire);
    server.receive(&wire).unwrap();
    assert!(server.take_output().is_empty());
    assert!(!server.is_closed());

    // The session then proceeds normally under the cipher.
    let body = "SEQ:0,1513833032,1,0\nDICT:0,C,100,temperature\n0,0,2561\n";
    let mut wire = Vec::new();
    enc.feed(body.as_bytes(), &mut wire);
    enc.feed(sig_line(body).as_bytes(), &mut wire);
    enc.flush(&mut wire);
    server.receive(&wire).unwrap();
    assert_eq!(server.take_output(), b"OK:0\n".to_vec());
}

#[test]
fn commit_failure_yields_nok_and_session_survives() {
    let mut server = new_server(false);
    server.take_output();
    server.sink_mut().fail_commit = true;

    let body = "SEQ:0,100,1,0\nDICT:0,C,100,temperature\n0,0,1\n";
    let upload = format!("{}{}{}", auth_line(), body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.take_output(), b"NOK:0\n".to_vec());
    assert!(!server.is_closed());

    // A NOK does not advance the committed id, so the client may retry it.
    server.sink_mut().fail_commit = false;
    let upload = format!("{}{}", body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.take_output(), b"OK:0\n".to_vec());
}

#[test]
fn idle_abort_discards_the_open_sequence() {
    let mut server = new_server(false);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.receive(b"SEQ:0,100,1,0\n").unwrap();
    server.idle_abort();
    assert!(server.is_closed());
    assert_eq!(server.sink().aborted_seqids(), vec![0]);
    assert!(server.sink().committed_seqids().is_empty());
}

#[test]
fn spanned_format_samples_decode() {
    let mut server = new_server(false);
    server.take_output();
    let body = "SEQ:0,1000,10,1\nDICT:2,W,1,power\n2,5,60,230,231\n";
    let upload = format!("{}{}{}", auth_line(), body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();
    assert_eq!(server.take_output(), b"OK:0\n".to_vec());

    let samples = server.sink().committed_samples(0);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].span, 60);
    assert_eq!((samples[0].time_num, samples[0].time_div), (1005, 10));
    assert_eq!(samples[0].values, vec!["230", "231"]);
}

#[test]
fn notifications_are_whole_lines_between_responses() {
    let mut server = new_server(false);
    server.take_output();
    server.receive(auth_line().as_bytes()).unwrap();
    server.notify(&s4pp_proto::Notification::Time {
        utc_sec: 1_700_000_000,
        utc_ms: 5,
    });
    assert_eq!(server.take_output(), b"NTFY:0,1700000000,5\n".to_vec());
}

// ---------------------------------------------------------------------------
// Client↔server loopbacks
// ---------------------------------------------------------------------------

fn client_config() -> ClientConfig {
    let mut cfg = ClientConfig::new(KEYID, KEY);
    cfg.send_hello = true;
    cfg
}

fn pump(
    client: &mut ClientSession,
    server: &mut ServerSession<MemoryKeyStore, RecordingSink>,
) {
    loop {
        let up = client.take_output();
        let down = server.take_output();
        if up.is_empty() && down.is_empty() {
            return;
        }
        if !up.is_empty() {
            server.receive(&up).unwrap();
        }
        if !down.is_empty() {
            client.receive(&down).unwrap();
        }
    }
}

#[test]
fn loopback_plain_upload_commits() {
    let mut server = new_server(false);
    let mut client = ClientSession::new(client_config());
    pump(&mut client, &mut server);
    assert!(client.is_ready());
    assert_eq!(client.server_max_samples(), 2000);

    let seqid = client.begin_sequence(1_513_833_032, 1, 0).unwrap();
    client.put_dict_entry(0, "C", 100, "temperature").unwrap();
    client.push_sample(0, 0, "2561").unwrap();
    assert_eq!(client.finish_sequence().unwrap(), seqid);
    pump(&mut client, &mut server);

    assert_eq!(client.take_events(), vec![ClientEvent::Committed(seqid)]);
    let samples = server.sink().committed_samples(seqid);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].values, vec!["2561"]);
}

#[test]
fn loopback_hidden_upload_commits() {
    let mut server = new_server(true);
    let mut client = ClientSession::new(client_config());
    pump(&mut client, &mut server);

    let mut salt = ScriptedEntropy::new(&["99aabbccddeeff0011223344556677f9"]);
    client.activate_hide(HideAlg::Aes128Cbc, &mut salt).unwrap();

    let seqid = client.begin_sequence(1_513_833_032, 1, 0).unwrap();
    client.put_dict_entry(0, "C", 100, "temperature").unwrap();
    client.push_sample(0, 0, "2561").unwrap();
    client.finish_sequence().unwrap();
    pump(&mut client, &mut server);

    assert_eq!(client.take_events(), vec![ClientEvent::Committed(seqid)]);
    assert_eq!(server.sink().committed_samples(seqid).len(), 1);
}

#[test]
fn loopback_multiple_sequences_have_increasing_ids() {
    let mut server = new_server(false);
    let mut client = ClientSession::new(client_config());
    pump(&mut client, &mut server);

    for round in 0..3u64 {
        let seqid = client.begin_sequence(1000 + round as i64, 1, 0).unwrap();
        assert_eq!(seqid, round);
        client.put_dict_entry(0, "", 1, "counter").unwrap();
        client.push_sample(0, 0, "1").unwrap();
        client.finish_sequence().unwrap();
    }
    pump(&mut client, &mut server);

    assert_eq!(server.sink().committed_seqids(), vec![0, 1, 2]);
    assert_eq!(
        client.take_events(),
        vec![
            ClientEvent::Committed(0),
            ClientEvent::Committed(1),
            ClientEvent::Committed(2),
        ]
    );
}

// ---------------------------------------------------------------------------
// Client-side behaviour
// ---------------------------------------------------------------------------

#[test]
fn client_parses_legacy_hello_without_hide_list() {
    let mut client = ClientSession::new(ClientConfig::new(KEYID, KEY));
    client
        .receive(format!("S4PP/1.0 SHA256 500\nTOK:{TOKEN_HEX}\n").as_bytes())
        .unwrap();
    assert!(client.is_ready());
    assert_eq!(client.server_max_samples(), 500);
    let out = client.take_output();
    assert!(out.starts_with(b"AUTH:SHA256,1234,"));
}

#[test]
fn client_auth_proof_covers_keyid_and_ascii_token() {
    let mut client = ClientSession::new(ClientConfig::new(KEYID, KEY));
    client
        .receive(format!("S4PP/1.2 SHA256 2000 -\nTOK:{TOKEN_HEX}\n").as_bytes())
        .unwrap();
    let expected = hmac_once(HashAlg::Sha256, KEY, &[KEYID.as_bytes(), TOKEN_HEX.as_bytes()]);
    let line = format!("AUTH:SHA256,{},{}\n", KEYID, hex::encode(expected));
    assert_eq!(client.take_output(), line.into_bytes());
}

#[test]
fn client_drops_unknown_notification_without_trace() {
    let mut client = ClientSession::new(ClientConfig::new(KEYID, KEY));
    client
        .receive(format!("S4PP/1.2 SHA256 2000 -\nTOK:{TOKEN_HEX}\n").as_bytes())
        .unwrap();
    client.take_output();

    client.receive(b"NTFY:9999,whatever\n").unwrap();
    assert!(client.take_events().is_empty());
    assert!(client.take_output().is_empty());
    assert!(client.is_ready());

    // Known codes surface as events.
    client.receive(b"NTFY:2,1b,4\n").unwrap();
    assert_eq!(
        client.take_events(),
        vec![ClientEvent::Notification(s4pp_proto::Notification::Flags {
            set: 0x1b,
            clear: 0x4,
        })]
    );
}

#[test]
fn client_treats_reject_as_session_end() {
    let mut client = ClientSession::new(ClientConfig::new(KEYID, KEY));
    client
        .receive(format!("S4PP/1.2 SHA256 2000 -\nTOK:{TOKEN_HEX}\n").as_bytes())
        .unwrap();
    client.take_output();

    client.receive(b"REJ:auth\n").unwrap();
    assert_eq!(
        client.take_events(),
        vec![ClientEvent::Rejected("auth".to_owned())]
    );
    assert!(client.is_closed());
    assert_eq!(client.begin_sequence(0, 1, 0), Err(s4pp_engine::ClientError::Closed));
}

#[test]
fn client_guards_sequence_misuse() {
    let mut client = ClientSession::new(ClientConfig::new(KEYID, KEY));
    assert_eq!(
        client.begin_sequence(0, 1, 0),
        Err(s4pp_engine::ClientError::NotReady)
    );

    client
        .receive(format!("S4PP/1.2 SHA256 2000 -\nTOK:{TOKEN_HEX}\n").as_bytes())
        .unwrap();
    client.take_output();

    assert_eq!(
        client.begin_sequence(0, 0, 0),
        Err(s4pp_engine::ClientError::ZeroDivisor)
    );
    client.begin_sequence(0, 1, 0).unwrap();
    assert_eq!(
        client.push_sample(5, 0, "1"),
        Err(s4pp_engine::ClientError::UnknownDictIndex(5))
    );
    assert_eq!(
        client.put_dict_entry(0, "C", 100, "bad,name"),
        Err(s4pp_engine::ClientError::CommaInField)
    );
    client.put_dict_entry(0, "C", 100, "temperature").unwrap();
    assert_eq!(
        client.push_sample(0, 0, ""),
        Err(s4pp_engine::ClientError::EmptyValue)
    );
    client.push_sample(0, 0, "NaN").unwrap();
}

#[test]
fn client_refuses_hide_the_server_does_not_offer() {
    let mut server = new_server(false);
    let mut client = ClientSession::new(client_config());
    pump(&mut client, &mut server);

    let mut salt = ScriptedEntropy::new(&["00112233445566778899aabbccddeeff"]);
    assert_eq!(
        client.activate_hide(HideAlg::Aes128Cbc, &mut salt),
        Err(s4pp_engine::ClientError::HideUnavailable(
            "AES-128-CBC".to_owned()
        ))
    );
}

#[test]
fn sink_call_order_is_begin_emit_commit() {
    let mut server = new_server(false);
    server.take_output();
    let body = "SEQ:0,100,1,0\nDICT:0,C,100,temperature\n0,0,1\n0,1,2\n";
    let upload = format!("{}{}{}", auth_line(), body, sig_line(body));
    server.receive(upload.as_bytes()).unwrap();

    let calls = &server.sink().calls;
    assert!(matches!(calls[0], SinkCall::Begin(0)));
    assert!(matches!(calls[1], SinkCall::Emit(_)));
    assert!(matches!(calls[2], SinkCall::Emit(_)));
    assert!(matches!(calls[3], SinkCall::Commit(0)));
}
