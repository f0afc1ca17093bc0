//! Scripted-device helpers shared by the session tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use headconf::HeadsetConfig;
use headproto::loopback::{loopback, pair, Acceptor, DeviceEnd, LoopbackConnector};
use headproto::{
    AckStatus, DeviceInfo, DeviceMessage, DeviceModel, HostCommand, Opcode, Version,
    PROTOCOL_VERSION,
};
use headset::Session;

pub const DEVICE: &str = "HALO-1";

pub fn identity() -> DeviceInfo {
    DeviceInfo {
        model: DeviceModel::Halo,
        serial_number: 4242,
        hardware_version: Version::new(1, 0, 0),
        firmware_version: Version::new(2, 1, 0),
        electrode_count: 8,
        has_accelerometer: true,
        sample_frequency: 250,
    }
}

/// A session driven against a hand-played device end
pub struct Harness {
    pub session: Session,
    pub device: DeviceEnd,
    pub connector: LoopbackConnector,
    pub acceptor: Acceptor,
}

impl Harness {
    pub async fn connected() -> Self {
        Self::connected_with(&HeadsetConfig::default()).await
    }

    pub async fn connected_with(config: &HeadsetConfig) -> Self {
        let (connector, mut acceptor) = loopback();
        let mut session = Session::new(Arc::new(connector.clone()), config).unwrap();
        let device = accept_and_identify(&mut session, &mut acceptor).await;
        Self {
            session,
            device,
            connector,
            acceptor,
        }
    }

    /// Reconnect the same session after the previous link went away.
    pub async fn reconnect(&mut self) {
        self.device = accept_and_identify(&mut self.session, &mut self.acceptor).await;
    }

    /// Play an unsolicited link loss from the device side.
    pub fn drop_link(&mut self) {
        let (_, placeholder) = pair("placeholder");
        std::mem::replace(&mut self.device, placeholder).drop_link();
    }

    pub async fn expect_command(&mut self) -> HostCommand {
        tokio::time::timeout(Duration::from_secs(5), self.device.recv_command())
            .await
            .expect("timed out waiting for a host command")
            .expect("host closed the link")
    }

    pub fn ack(&self, op: Opcode, status: AckStatus) {
        self.device.send(&DeviceMessage::Ack { op, status }).unwrap();
    }

    /// Start a stream and answer it.
    pub async fn start_streaming(&mut self) {
        let completion = self.session.start_stream().unwrap();
        assert!(matches!(self.expect_command().await, HostCommand::StartStream(_)));
        self.ack(Opcode::StartStream, AckStatus::Ok);
        completion.await.unwrap();
    }
}

async fn accept_and_identify(session: &mut Session, acceptor: &mut Acceptor) -> DeviceEnd {
    let completion = session.connect(DEVICE).unwrap();
    let mut device = acceptor.accept().await.unwrap();
    assert_eq!(
        device.recv_command().await,
        Some(HostCommand::Handshake {
            protocol_version: PROTOCOL_VERSION
        })
    );
    device.send(&DeviceMessage::Identity(identity())).unwrap();
    completion.await.unwrap();
    device
}

/// Poll `condition` until it holds or a few seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
