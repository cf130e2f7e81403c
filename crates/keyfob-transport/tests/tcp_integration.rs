//! TCP board-link integration tests.

use keyfob_core::feature::FeaturePackage;
use keyfob_core::{Car, CarEvent, CarRecord, CarStatus, DeviceState, Fob, Pin, SessionConfig};
use keyfob_crypto::{AuthorityKeyPair, SharedSecret};
use keyfob_platform::mock::MemoryStore;
use keyfob_platform::{ByteChannel, Error as PlatformError};
use keyfob_transport::{TcpChannel, TcpEndpoint};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::thread;
use std::time::Duration;

fn connected() -> (TcpChannel, TcpChannel) {
    let endpoint = TcpEndpoint::server("127.0.0.1:0").unwrap();
    let addr = endpoint.local_addr().unwrap();
    let server = thread::spawn(move || endpoint.accept().unwrap());
    let client = TcpChannel::connect(addr).unwrap();
    (server.join().unwrap(), client)
}

#[test]
fn test_bytes_cross_in_order() {
    let (mut server, mut client) = connected();
    client.send(&[0x48, 0x00, 0x10]).unwrap();
    let mut buf = [0u8; 3];
    server.recv_exact(&mut buf).unwrap();
    assert_eq!(buf, [0x48, 0x00, 0x10]);

    server.send(b"A").unwrap();
    assert_eq!(client.recv_byte().unwrap(), b'A');
}

#[test]
fn test_read_timeout() {
    let (mut server, _client) = connected();
    server
        .set_read_timeout(Some(Duration::from_millis(20)))
        .unwrap();
    assert!(matches!(server.recv_byte(), Err(PlatformError::Timeout)));

    // A zero timeout still times out instead of blocking forever.
    server.set_read_timeout(Some(Duration::ZERO)).unwrap();
    assert!(matches!(server.recv_byte(), Err(PlatformError::Timeout)));
}

#[test]
fn test_peer_close_is_disconnect() {
    let (mut server, client) = connected();
    drop(client);
    assert!(matches!(server.recv_byte(), Err(PlatformError::Disconnected)));
}

#[test]
fn test_unlock_and_start_over_tcp() {
    const CAR_ID: u32 = 77;
    let authority = AuthorityKeyPair::from_bytes(&[0x44; 32]).unwrap();
    let secret = SharedSecret::from_bytes([0x33; 32]);

    let endpoint = TcpEndpoint::server("127.0.0.1:0").unwrap();
    let addr = endpoint.local_addr().unwrap();

    let car_config = SessionConfig::new(authority.public_key()).with_secret(secret.clone());
    let car = thread::spawn(move || {
        let channel = endpoint.accept().unwrap();
        let mut car = Car::boot(
            CAR_ID,
            channel,
            MemoryStore::new(),
            || CarRecord::new(b"hello", &[b"heated seats"]).unwrap(),
            car_config,
            StdRng::seed_from_u64(1),
            Vec::new(),
        )
        .unwrap();
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(car.step().unwrap());
        }
        (car.status(), car.output().clone(), events)
    });

    let channel = TcpChannel::connect_with_retry(addr, 10, Duration::from_millis(10)).unwrap();
    let mut fob = Fob::boot(
        channel,
        MemoryStore::new(),
        move || DeviceState::paired(CAR_ID, Pin::from_slice(b"654321").unwrap(), secret),
        SessionConfig::new(authority.public_key()).with_timeout(Some(Duration::from_secs(5))),
    )
    .unwrap();
    fob.enable(&FeaturePackage::sign(&authority, CAR_ID, 1).to_hex())
        .unwrap();
    fob.unlock_and_start().unwrap();

    let (status, output, events) = car.join().unwrap();
    assert_eq!(status, CarStatus::Started);
    assert_eq!(output, b"hello\nheated seats\n");
    assert_eq!(events[2], CarEvent::Started { features: vec![1] });
}
