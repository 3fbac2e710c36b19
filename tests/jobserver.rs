//! End-to-end scenarios driven against real anonymous pipes, not mocks.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::time::Duration;

use jobserver_core::{Client, Proxy, Server, WakeReason};

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

#[test]
fn server_distributes_tokens_across_competing_children() {
    let mut server = Server::new(Some(2)).unwrap();

    let (_child_a, pass_a) = server.create_client().unwrap();
    let (_child_b, pass_b) = server.create_client().unwrap();

    let mut reader_a = unsafe { std::fs::File::from_raw_fd(pass_a.p2c_rd) };
    let mut reader_b = unsafe { std::fs::File::from_raw_fd(pass_b.p2c_rd) };

    // Both children are eligible for a grant; the server should drain its
    // pool across them within a couple of cycles regardless of dispatch
    // order, since the pool only has two tokens total.
    for _ in 0..2 {
        server.poll(Some(Duration::from_millis(500))).unwrap();
    }

    let mut buf = [0u8; 1];
    reader_a.read_exact(&mut buf).unwrap();
    assert_eq!(buf[0], b'+');
    reader_b.read_exact(&mut buf).unwrap();
    assert_eq!(buf[0], b'+');
}

#[test]
fn server_reclaims_returned_token_and_regrants_it() {
    let mut server = Server::new(Some(1)).unwrap();
    let (child, pass_fds) = server.create_client().unwrap();

    let mut child_read = unsafe { std::fs::File::from_raw_fd(pass_fds.p2c_rd) };
    let mut child_write = unsafe { std::fs::File::from_raw_fd(pass_fds.c2p_wr) };

    server.poll(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 1];
    child_read.read_exact(&mut buf).unwrap();

    // Return it, then register a second child competing for the same
    // single token.
    child_write.write_all(&buf).unwrap();
    server.poll(Some(Duration::from_millis(500))).unwrap();

    let (_child2, pass_fds2) = server.create_client().unwrap();
    let mut child2_read = unsafe { std::fs::File::from_raw_fd(pass_fds2.p2c_rd) };
    server.poll(Some(Duration::from_millis(500))).unwrap();
    child2_read.read_exact(&mut buf).unwrap();
    assert_eq!(buf[0], b'+');

    server.cleanup_client(child, false).unwrap();
}

#[test]
fn cleanup_reclaims_tokens_from_a_child_that_vanished() {
    let mut server = Server::new(Some(1)).unwrap();
    let (child, pass_fds) = server.create_client().unwrap();

    {
        let mut child_read = unsafe { std::fs::File::from_raw_fd(pass_fds.p2c_rd) };
        server.poll(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 1];
        child_read.read_exact(&mut buf).unwrap();
        let _child_write = unsafe { std::fs::File::from_raw_fd(pass_fds.c2p_wr) };
        // Dropped here: simulates the child dying while still holding its
        // one token, without ever writing it back.
    }

    server.cleanup_client(child, true).unwrap();

    // The reclaimed token is handed out again to a fresh child.
    let (_child2, pass_fds2) = server.create_client().unwrap();
    let mut child2_read = unsafe { std::fs::File::from_raw_fd(pass_fds2.p2c_rd) };
    server.poll(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 1];
    child2_read.read_exact(&mut buf).unwrap();
    assert_eq!(buf[0], b'+');
}

#[test]
fn proxy_relays_a_token_from_upstream_to_a_local_child() {
    // Build an upstream jobserver pipe pair by hand and connect a `Client`
    // to it, the same way `Client::from_makeflags` would against a real
    // `make`-spawned jobserver.
    let mut upstream_grant_fds = [0; 2];
    let mut upstream_return_fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(upstream_grant_fds.as_mut_ptr()) }, 0);
    assert_eq!(unsafe { libc::pipe(upstream_return_fds.as_mut_ptr()) }, 0);
    let [grant_read, grant_write] = upstream_grant_fds;
    let [return_read, return_write] = upstream_return_fds;

    let flags = format!("-j --jobserver-fds={grant_read},{return_write}");
    let upstream_client = Client::from_makeflags(&flags).unwrap();

    let mut upstream_grant = unsafe { std::fs::File::from_raw_fd(grant_write) };
    let mut upstream_return = unsafe { std::fs::File::from_raw_fd(return_read) };

    let mut proxy = Proxy::new(upstream_client).unwrap();
    let (_child, pass_fds) = proxy.create_client().unwrap();
    let mut child_read = unsafe { std::fs::File::from_raw_fd(pass_fds.p2c_rd) };
    set_nonblocking(child_read.as_raw_fd());

    // Drain the implicit token the upstream client starts with so the next
    // grow genuinely goes over the wire.
    let _ = proxy.poll(Some(Duration::from_millis(50)));
    upstream_grant.write_all(b"+").unwrap();

    let mut relayed = false;
    for _ in 0..40 {
        let reason = proxy.poll(Some(Duration::from_millis(50))).unwrap();
        if reason == WakeReason::Timeout {
            continue;
        }
        let mut buf = [0u8; 1];
        match child_read.read(&mut buf) {
            Ok(1) => {
                relayed = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(relayed, "proxy never relayed the upstream token downstream");

    proxy.cleanup().unwrap();

    // The proxy must have returned every spare token upstream by the time
    // cleanup finishes.
    set_nonblocking(upstream_return.as_raw_fd());
    let mut buf = [0u8; 1];
    match upstream_return.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(_) => {}
    }
}

#[test]
fn sigchld_wakes_a_blocked_poll_instead_of_hanging() {
    let mut server = Server::new(Some(1)).unwrap();
    let (_child, _pass_fds) = server.create_client().unwrap();

    unsafe {
        libc::raise(libc::SIGCHLD);
    }

    // With the self-pipe registered, this must return promptly with
    // `WakeReason::Signal` rather than blocking for the full timeout (or
    // forever, under `poll(None)`).
    let reason = server.poll(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(reason, WakeReason::Signal);
}
