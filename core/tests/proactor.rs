use sockmux_core::SocketProactor;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn nonblocking_pair() -> std::io::Result<(UnixStream, UnixStream)> {
    let (left, right) = UnixStream::pair()?;
    left.set_nonblocking(true)?;
    right.set_nonblocking(true)?;
    Ok((left, right))
}

fn spawn_loop(proactor: &Arc<SocketProactor>) -> std::thread::JoinHandle<()> {
    let runner = proactor.clone();
    std::thread::spawn(move || runner.run())
}

#[test]
fn stream_receive_completes_once_with_the_payload() -> std::io::Result<()> {
    let (mut left, right) = nonblocking_pair()?;
    let proactor = Arc::new(SocketProactor::new()?);
    let (tx, rx) = mpsc::channel();
    proactor.add_receive(
        right.as_raw_fd(),
        Vec::new(),
        Some(Box::new(move |event| {
            tx.send((event.result, event.buffer)).unwrap();
        })),
    )?;
    let handle = spawn_loop(&proactor);
    left.write_all(b"hello")?;

    let (result, buffer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(5, result.unwrap());
    assert_eq!(b"hello", buffer.as_slice());
    // one submission, one completion
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(!proactor.has_socket_handlers());

    proactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn stream_send_completes_and_the_bytes_arrive() -> std::io::Result<()> {
    let (left, right) = nonblocking_pair()?;
    let proactor = Arc::new(SocketProactor::new()?);
    let (tx, rx) = mpsc::channel();
    proactor.add_send(
        left.as_raw_fd(),
        b"ping".to_vec(),
        Some(Box::new(move |event| {
            tx.send(event.result).unwrap();
        })),
    )?;
    let handle = spawn_loop(&proactor);
    assert_eq!(4, rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap());

    let mut right = right;
    let mut buffer = [0u8; 16];
    let mut read = 0;
    while read < 4 {
        match right.read(&mut buffer[read..]) {
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
    assert_eq!(b"ping", &buffer[..4]);

    proactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn datagram_round_trip_reports_the_peer() -> std::io::Result<()> {
    let sender = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let receiver = std::net::UdpSocket::bind("127.0.0.1:0")?;
    sender.set_nonblocking(true)?;
    receiver.set_nonblocking(true)?;
    let sender_addr = sender.local_addr()?;
    let receiver_addr = receiver.local_addr()?;

    let proactor = Arc::new(SocketProactor::new()?);
    let (tx, rx) = mpsc::channel();
    proactor.add_receive_from(
        receiver.as_raw_fd(),
        Vec::new(),
        Some(Box::new(move |event| {
            tx.send((event.result, event.buffer, event.peer))
                .unwrap();
        })),
    )?;
    proactor.add_send_to(sender.as_raw_fd(), b"dgram".to_vec(), receiver_addr, None)?;
    let handle = spawn_loop(&proactor);

    let (result, buffer, peer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(5, result.unwrap());
    assert_eq!(b"dgram", buffer.as_slice());
    assert_eq!(Some(sender_addr), peer);

    proactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn queued_receives_complete_in_submission_order() -> std::io::Result<()> {
    let (mut left, right) = nonblocking_pair()?;
    let proactor = Arc::new(SocketProactor::new()?);
    let (tx, rx) = mpsc::channel();
    for tag in 0..2u8 {
        let tx = tx.clone();
        proactor.add_receive(
            right.as_raw_fd(),
            vec![0u8; 3],
            Some(Box::new(move |event| {
                tx.send((tag, event.buffer)).unwrap();
            })),
        )?;
    }
    let handle = spawn_loop(&proactor);
    left.write_all(b"abc")?;

    let (tag, buffer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!((0, b"abc".to_vec()), (tag, buffer));

    left.write_all(b"def")?;
    let (tag, buffer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!((1, b"def".to_vec()), (tag, buffer));

    proactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn clean_peer_close_completes_with_zero_bytes() -> std::io::Result<()> {
    let (left, right) = nonblocking_pair()?;
    let proactor = Arc::new(SocketProactor::new()?);
    let (tx, rx) = mpsc::channel();
    proactor.add_receive(
        right.as_raw_fd(),
        Vec::new(),
        Some(Box::new(move |event| {
            tx.send((event.result, event.buffer)).unwrap();
        })),
    )?;
    let handle = spawn_loop(&proactor);
    drop(left);

    // an orderly shutdown is end-of-stream, not an error
    let (result, buffer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(0, result.unwrap());
    assert!(buffer.is_empty());

    proactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn submissions_survive_a_concurrent_interest_resync() -> std::io::Result<()> {
    let (mut left, right) = nonblocking_pair()?;
    let proactor = Arc::new(SocketProactor::new()?);
    let handle = spawn_loop(&proactor);

    // each round races a fresh submission against the loop shrinking the
    // previous one's interest; a lost registration would stall the channel
    let (tx, rx) = mpsc::channel();
    for round in 0..100u32 {
        let tx = tx.clone();
        proactor.add_receive(
            right.as_raw_fd(),
            vec![0u8; 4],
            Some(Box::new(move |event| {
                tx.send((round, event.result)).unwrap();
            })),
        )?;
        left.write_all(&round.to_be_bytes())?;
        let (seen, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(round, seen);
        assert_eq!(4, result.unwrap());
    }
    assert!(!proactor.has_socket_handlers());

    proactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn scheduled_work_runs_inside_the_loop() -> std::io::Result<()> {
    let proactor = Arc::new(SocketProactor::new()?);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    proactor.add_work(
        Arc::new(move || {
            _ = counter.fetch_add(1, Ordering::Relaxed);
        }),
        Some(Duration::from_millis(10)),
    )?;
    assert_eq!(1, proactor.scheduled_work()?);
    let handle = spawn_loop(&proactor);
    while hits.load(Ordering::Relaxed) == 0 {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(0, proactor.scheduled_work()?);
    proactor.stop();
    handle.join().unwrap();
    assert_eq!(1, hits.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn stop_before_run_returns_immediately() -> std::io::Result<()> {
    let proactor = SocketProactor::new()?;
    proactor.stop();
    proactor.run();
    Ok(())
}

#[test]
fn wait_shuts_the_completion_thread_down() -> std::io::Result<()> {
    let (mut left, right) = nonblocking_pair()?;
    let proactor = Arc::new(SocketProactor::new()?);
    let (tx, rx) = mpsc::channel();
    proactor.add_receive(
        right.as_raw_fd(),
        Vec::new(),
        Some(Box::new(move |event| {
            tx.send(event.result.is_ok()).unwrap();
        })),
    )?;
    let handle = spawn_loop(&proactor);
    left.write_all(b"x")?;
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    proactor.stop();
    handle.join().unwrap();
    proactor.wait();
    Ok(())
}
