//! End-to-end scenarios against an in-process fake Gearman server: a raw
//! `TcpListener` that scripts a fixed exchange of binary frames/admin text
//! lines, independent of the crate's own (client-side-only) wire module.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use gearman_rs::admin::Admin;
use gearman_rs::client::{Client, SubmitOptions};
use gearman_rs::job::RequestState;
use gearman_rs::worker::Worker;

const MAGIC_REQ: [u8; 4] = [0, b'R', b'E', b'Q'];
const MAGIC_RES: [u8; 4] = [0, b'R', b'E', b'S'];

async fn bind_loopback() -> (TcpListener, u16) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind loopback");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Reads one `\0REQ` binary frame the client sent us, returning its numeric
/// type and raw NUL-joined payload.
async fn read_req_frame(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    let mut header = [0u8; 12];
    stream.read_exact(&mut header).await.expect("read frame header");
    assert_eq!(&header[0..4], &MAGIC_REQ, "expected a REQ frame from the client");
    let ptype = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.expect("read frame payload");
    (ptype, payload)
}

/// Writes one `\0RES` binary frame back to the client.
async fn write_res_frame(stream: &mut TcpStream, ptype: u32, fields: &[&[u8]]) {
    let payload = fields.join(&0u8);
    let mut buf = Vec::with_capacity(12 + payload.len());
    buf.extend_from_slice(&MAGIC_RES);
    buf.extend_from_slice(&ptype.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    stream.write_all(&buf).await.expect("write frame");
}

/// Like [`read_req_frame`], but gives up and returns `None` after `within` —
/// for asserting that the client does NOT send anything in a time window.
async fn try_read_req_frame(stream: &mut TcpStream, within: Duration) -> Option<(u32, Vec<u8>)> {
    tokio::time::timeout(within, read_req_frame(stream)).await.ok()
}

async fn write_text_line(stream: &mut TcpStream, line: &str) {
    stream.write_all(line.as_bytes()).await.expect("write text line");
    stream.write_all(b"\n").await.expect("write newline");
}

async fn read_text_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.expect("read text byte");
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).expect("valid utf8 admin line")
}

// Packet type codes, duplicated here so the fake server doesn't need to
// depend on the crate's own protocol module for anything but a sanity check.
const RESET_ABILITIES: u32 = 3;
const CAN_DO: u32 = 1;
const SUBMIT_JOB: u32 = 7;
const JOB_CREATED: u32 = 8;
const WORK_COMPLETE: u32 = 13;
const SUBMIT_JOB_BG: u32 = 18;
const GRAB_JOB_UNIQ: u32 = 30;
const JOB_ASSIGN_UNIQ: u32 = 31;
const NOOP: u32 = 6;
const PRE_SLEEP: u32 = 4;

/// Scenario 1: foreground submit completes with the server's result.
#[tokio::test]
async fn foreground_submit_completes_with_result() {
    let (listener, port) = bind_loopback().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let (ptype, payload) = read_req_frame(&mut stream).await;
        assert_eq!(ptype, SUBMIT_JOB);
        assert!(payload.starts_with(b"reverse\0"));

        write_res_frame(&mut stream, JOB_CREATED, &[b"H:1"]).await;
        write_res_frame(&mut stream, WORK_COMPLETE, &[b"H:1", b"cba"]).await;
    });

    let mut client = Client::new();
    client.add_server("127.0.0.1", port);

    let opts = SubmitOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() };
    let request = client.submit_job("reverse", Bytes::from_static(b"abc"), opts).await.unwrap();

    let guard = request.lock();
    assert_eq!(guard.state, RequestState::Complete);
    assert_eq!(guard.result.as_deref(), Some(b"cba".as_slice()));
    assert!(!guard.timed_out);
    drop(guard);

    server.await.unwrap();
    client.shutdown().await;
}

/// Scenario 3: a background submit is complete the moment it's created, with
/// no result ever populated.
#[tokio::test]
async fn background_submit_completes_on_job_created() {
    let (listener, port) = bind_loopback().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let (ptype, _payload) = read_req_frame(&mut stream).await;
        assert_eq!(ptype, SUBMIT_JOB_BG);
        write_res_frame(&mut stream, JOB_CREATED, &[b"H:9"]).await;
        // Hold the connection open briefly so the client doesn't see an early EOF.
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let mut client = Client::new();
    client.add_server("127.0.0.1", port);

    let opts =
        SubmitOptions { background: true, timeout: Some(Duration::from_secs(5)), ..Default::default() };
    let request = client.submit_job("reverse", Bytes::from_static(b"abc"), opts).await.unwrap();

    let guard = request.lock();
    assert_eq!(guard.state, RequestState::Created);
    assert!(guard.is_complete());
    assert!(guard.result.is_none());
    drop(guard);

    server.await.unwrap();
    client.shutdown().await;
}

/// Scenario 4: worker grab/assign/complete cycle.
#[tokio::test]
async fn worker_completes_assigned_job() {
    let (listener, port) = bind_loopback().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");

        // on_connected: RESET_ABILITIES, CAN_DO "reverse", then PRE_SLEEP.
        let (reset_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(reset_ptype, RESET_ABILITIES);
        let (can_do_ptype, can_do_payload) = read_req_frame(&mut stream).await;
        assert_eq!(can_do_ptype, CAN_DO);
        assert_eq!(can_do_payload, b"reverse");
        let (presleep_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(presleep_ptype, PRE_SLEEP);

        write_res_frame(&mut stream, NOOP, &[]).await;

        let (grab_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(grab_ptype, GRAB_JOB_UNIQ);

        write_res_frame(&mut stream, JOB_ASSIGN_UNIQ, &[b"H:2", b"reverse", b"u1", b"hi"]).await;

        let (complete_ptype, complete_payload) = read_req_frame(&mut stream).await;
        assert_eq!(complete_ptype, WORK_COMPLETE);
        assert_eq!(complete_payload, b"H:2\0ih");

        // Hand the stream back instead of dropping it here: an EOF before the
        // test cancels the worker would send it into a reconnect attempt
        // against a listener that's no longer accepting.
        stream
    });

    let mut worker = Worker::new(1);
    worker.add_server("127.0.0.1", port);
    worker.register_task("reverse", |job| Ok(job.data.iter().rev().copied().collect::<Vec<u8>>().into()));

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker_task =
        tokio::spawn(async move { worker.work(&worker_cancel, Some(Duration::from_millis(50))).await });

    let _server_stream = server.await.unwrap();
    // The scripted exchange is done; stop the worker's poll loop from here,
    // since `work()` otherwise keeps running for as long as the connection
    // stays pollable.
    cancel.cancel();
    worker_task.await.unwrap().unwrap();
}

/// Scenario 2: retry on disconnect. A single server is used (rather than two
/// distinct listeners) so the test doesn't depend on which order the
/// client's randomized per-request server shuffle happens to try them in:
/// the server here accepts a connection, reads the submission, then drops
/// it before replying, forcing the client to reconnect and resubmit on the
/// same slot before it ever sees a server reply.
#[tokio::test]
async fn retry_after_disconnect_resubmits_and_completes() {
    let (listener, port) = bind_loopback().await;

    let server = tokio::spawn(async move {
        {
            let (mut stream, _) = listener.accept().await.expect("accept first connection");
            let (ptype, payload) = read_req_frame(&mut stream).await;
            assert_eq!(ptype, SUBMIT_JOB);
            assert!(payload.starts_with(b"reverse\0"));
            // Drop `stream` here: the server disappears before JOB_CREATED.
        }

        let (mut stream, _) = listener.accept().await.expect("accept second connection");
        let (ptype, payload) = read_req_frame(&mut stream).await;
        assert_eq!(ptype, SUBMIT_JOB);
        assert!(payload.starts_with(b"reverse\0"));

        write_res_frame(&mut stream, JOB_CREATED, &[b"H:3"]).await;
        write_res_frame(&mut stream, WORK_COMPLETE, &[b"H:3", b"cba"]).await;
    });

    let mut client = Client::new();
    client.add_server("127.0.0.1", port);

    let opts = SubmitOptions { timeout: Some(Duration::from_secs(5)), ..Default::default() };
    let request = client.submit_job("reverse", Bytes::from_static(b"abc"), opts).await.unwrap();

    let guard = request.lock();
    assert_eq!(guard.state, RequestState::Complete);
    assert_eq!(guard.result.as_deref(), Some(b"cba".as_slice()));
    assert!(!guard.timed_out);
    assert_eq!(guard.connect_attempts, 2);
    drop(guard);

    server.await.unwrap();
    client.shutdown().await;
}

/// Scenario 5: worker saturation. Concurrency is 1; a second `NOOP` arrives
/// while the first job's callback is still running in the background (the
/// handler re-enters `PRE_SLEEP` as soon as the job is handed to the pool,
/// not when it finishes). Expected: the second `NOOP` sets `_waiting` and
/// emits no second `GRAB_JOB_UNIQ` until the completing job's wake byte
/// re-triggers `prepare()`.
#[tokio::test]
async fn saturated_worker_defers_grab_until_slot_frees() {
    let (listener, port) = bind_loopback().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");

        let (reset_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(reset_ptype, RESET_ABILITIES);
        let (can_do_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(can_do_ptype, CAN_DO);
        let (presleep_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(presleep_ptype, PRE_SLEEP);

        write_res_frame(&mut stream, NOOP, &[]).await;
        let (grab_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(grab_ptype, GRAB_JOB_UNIQ);

        write_res_frame(&mut stream, JOB_ASSIGN_UNIQ, &[b"H:2", b"reverse", b"u1", b"hi"]).await;

        // The handler re-enters PRE_SLEEP immediately, before the callback
        // (spawned onto the pool) has finished.
        let (presleep2_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(presleep2_ptype, PRE_SLEEP);

        // A second NOOP arrives while the only pool slot is still occupied.
        write_res_frame(&mut stream, NOOP, &[]).await;

        // No GRAB_JOB_UNIQ should show up while the job is still running.
        let premature = try_read_req_frame(&mut stream, Duration::from_millis(50)).await;
        assert!(premature.is_none(), "worker grabbed a second job while saturated");

        // The first job finishes and its completion wakes the loop, which
        // re-runs `prepare()` and re-enters PRE_SLEEP for the stalled NOOP.
        let (complete_ptype, complete_payload) = read_req_frame(&mut stream).await;
        assert_eq!(complete_ptype, WORK_COMPLETE);
        assert_eq!(complete_payload, b"H:2\0ih");
        let (presleep3_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(presleep3_ptype, PRE_SLEEP);

        // With the slot free again, a third NOOP leads to a second grab.
        write_res_frame(&mut stream, NOOP, &[]).await;
        let (grab2_ptype, _) = read_req_frame(&mut stream).await;
        assert_eq!(grab2_ptype, GRAB_JOB_UNIQ);

        stream
    });

    let mut worker = Worker::new(1);
    worker.add_server("127.0.0.1", port);
    worker.register_task("reverse", |job| {
        std::thread::sleep(Duration::from_millis(150));
        Ok(job.data.iter().rev().copied().collect::<Vec<u8>>().into())
    });

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker_task =
        tokio::spawn(async move { worker.work(&worker_cancel, Some(Duration::from_millis(20))).await });

    let _server_stream = server.await.unwrap();
    cancel.cancel();
    worker_task.await.unwrap().unwrap();
}

/// Scenario 6: admin `status` accumulates rows until the `.` terminator.
#[tokio::test]
async fn admin_status_parses_rows_until_terminator() {
    let (listener, port) = bind_loopback().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let line = read_text_line(&mut stream).await;
        assert_eq!(line, "status");

        write_text_line(&mut stream, "task1\t3\t2\t4").await;
        write_text_line(&mut stream, "task2\t0\t0\t1").await;
        write_text_line(&mut stream, ".").await;
    });

    let mut admin = Admin::new();
    let idx = admin.add_server("127.0.0.1", port);
    let rows = admin.get_status(idx, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].task, "task1");
    assert_eq!(rows[0].queued, 3);
    assert_eq!(rows[0].running, 2);
    assert_eq!(rows[0].workers, 4);
    assert_eq!(rows[1].task, "task2");
    assert_eq!(rows[1].workers, 1);

    server.await.unwrap();
}
