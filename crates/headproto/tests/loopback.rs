//! Loopback link behaviour seen from both ends

use bytes::Bytes;
use headproto::loopback::loopback;
use headproto::{
    AckStatus, Connector, DeviceMessage, HostCommand, Opcode, TransportError, TransportEvent,
};

#[tokio::test]
async fn test_commands_reach_device_end() {
    let (connector, mut acceptor) = loopback();
    let mut link = connector.open("HALO-1").await.unwrap();
    let mut device = acceptor.accept().await.unwrap();
    assert_eq!(device.device(), "HALO-1");

    link.transport.send(HostCommand::StopStream.encode()).unwrap();
    assert_eq!(device.recv_command().await, Some(HostCommand::StopStream));

    device
        .send(&DeviceMessage::Ack {
            op: Opcode::StopStream,
            status: AckStatus::Ok,
        })
        .unwrap();
    let event = link.events.recv().await.unwrap();
    let TransportEvent::Frame(bytes) = event else {
        panic!("expected a frame, got {:?}", event);
    };
    assert_eq!(
        DeviceMessage::decode(&bytes).unwrap(),
        DeviceMessage::Ack {
            op: Opcode::StopStream,
            status: AckStatus::Ok,
        }
    );
}

#[tokio::test]
async fn test_undecodable_host_frames_are_skipped() {
    let (connector, mut acceptor) = loopback();
    let mut link = connector.open("HALO-1").await.unwrap();
    let mut device = acceptor.accept().await.unwrap();

    link.transport.send(Bytes::from_static(b"\x00garbage")).unwrap();
    link.transport.send(HostCommand::RequestConfig.encode()).unwrap();
    assert_eq!(device.recv_command().await, Some(HostCommand::RequestConfig));
}

#[tokio::test]
async fn test_drop_link_signals_link_lost() {
    let (connector, mut acceptor) = loopback();
    let mut link = connector.open("HALO-1").await.unwrap();
    let device = acceptor.accept().await.unwrap();

    device.drop_link();
    assert_eq!(link.events.recv().await, Some(TransportEvent::LinkLost));
    assert_eq!(link.events.recv().await, None);
    assert_eq!(
        link.transport.send(HostCommand::StopStream.encode()),
        Err(TransportError::Closed)
    );
}

#[tokio::test]
async fn test_refusing_connector() {
    let (connector, _acceptor) = loopback();
    connector.set_refusing(true);
    let err = connector.open("HALO-9").await.unwrap_err();
    assert_eq!(err, TransportError::Refused("HALO-9".to_string()));

    connector.set_refusing(false);
    assert!(connector.open("HALO-9").await.is_ok());
}

#[tokio::test]
async fn test_open_without_acceptor_is_not_found() {
    let (connector, acceptor) = loopback();
    drop(acceptor);
    let err = connector.open("HALO-2").await.unwrap_err();
    assert_eq!(err, TransportError::NotFound("HALO-2".to_string()));
}
