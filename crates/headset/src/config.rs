//! Channel configuration store.
//!
//! [`StagedConfig`] collects per-channel edits at any time. `start_stream`
//! consumes it into an immutable [`CommittedConfig`] whose channel order (the
//! order channels were enabled) fixes the index of every channel in the
//! delivered chunks.

use std::collections::HashMap;

use headproto::{ChannelId, ChannelSettings, DeviceInfo, GainMode, ImpedanceMode, Polarity, StreamSetup};
use tracing::{debug, warn};

/// Channel edits waiting for the next stream start
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedConfig {
    impedance: ImpedanceMode,
    /// Entries in enable order; disabled entries keep their gain and bias.
    entries: Vec<(ChannelId, ChannelSettings)>,
}

impl StagedConfig {
    /// Stage exactly what the device reported as persisted.
    pub fn from_setup(setup: &StreamSetup) -> Self {
        Self {
            impedance: setup.impedance,
            entries: setup.channels.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.impedance == ImpedanceMode::Off
    }

    fn position(&self, channel: ChannelId) -> Option<usize> {
        self.entries.iter().position(|(id, _)| *id == channel)
    }

    /// Enabling a channel that is not already enabled moves it to the end of
    /// the enable order.
    pub fn set_enabled(&mut self, channel: ChannelId, enabled: bool) {
        match self.position(channel) {
            Some(i) if self.entries[i].1.enabled == enabled => {}
            Some(i) if enabled => {
                let (id, mut settings) = self.entries.remove(i);
                settings.enabled = true;
                self.entries.push((id, settings));
            }
            Some(i) => self.entries[i].1.enabled = false,
            None => self.entries.push((
                channel,
                ChannelSettings {
                    enabled,
                    ..Default::default()
                },
            )),
        }
    }

    fn analog_entry(&mut self, channel: ChannelId) -> Option<&mut ChannelSettings> {
        if !channel.has_analog_capability() {
            debug!("{} has no analog front end, ignoring gain/bias", channel);
            return None;
        }
        let i = match self.position(channel) {
            Some(i) => i,
            None => {
                self.entries.push((channel, ChannelSettings::default()));
                self.entries.len() - 1
            }
        };
        Some(&mut self.entries[i].1)
    }

    /// No-op for channels without an analog front end.
    pub fn set_gain(&mut self, channel: ChannelId, gain: GainMode) {
        if let Some(settings) = self.analog_entry(channel) {
            settings.gain = gain;
        }
    }

    /// No-op for channels without an analog front end.
    pub fn set_bias(&mut self, channel: ChannelId, bias: Polarity) {
        if let Some(settings) = self.analog_entry(channel) {
            settings.bias = bias;
        }
    }

    pub fn set_impedance(&mut self, mode: ImpedanceMode) {
        self.impedance = mode;
    }

    pub fn impedance(&self) -> ImpedanceMode {
        self.impedance
    }

    pub fn settings(&self, channel: ChannelId) -> Option<ChannelSettings> {
        self.position(channel).map(|i| self.entries[i].1)
    }

    /// Enabled channels in enable order
    pub fn enabled_channels(&self) -> Vec<ChannelId> {
        self.entries
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Freeze into a snapshot, dropping channels `device` cannot stream.
    pub fn commit(self, device: &DeviceInfo) -> CommittedConfig {
        let channels = self
            .entries
            .into_iter()
            .filter(|(id, _)| {
                let supported = device.supports(*id);
                if !supported {
                    warn!("{} is not available on this device, leaving it out of the stream", id);
                }
                supported
            })
            .collect();

        CommittedConfig::new(StreamSetup {
            impedance: self.impedance,
            channels,
        })
    }
}

/// Immutable configuration of the running stream
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedConfig {
    setup: StreamSetup,
    order: Vec<ChannelId>,
    index: HashMap<ChannelId, usize>,
}

impl CommittedConfig {
    fn new(setup: StreamSetup) -> Self {
        let order: Vec<ChannelId> = setup.enabled().collect();
        let index = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Self { setup, order, index }
    }

    /// Position of `channel` in every chunk, `None` if it is not streamed.
    pub fn channel_index(&self, channel: ChannelId) -> Option<usize> {
        self.index.get(&channel).copied()
    }

    /// Streamed channels in index order
    pub fn channels(&self) -> &[ChannelId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn setup(&self) -> &StreamSetup {
        &self.setup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headproto::{Axis, DeviceModel, Version};
    use pretty_assertions::assert_eq;

    fn device() -> DeviceInfo {
        DeviceInfo {
            model: DeviceModel::Halo,
            serial_number: 7,
            hardware_version: Version::new(1, 0, 0),
            firmware_version: Version::new(1, 0, 0),
            electrode_count: 8,
            has_accelerometer: false,
            sample_frequency: 250,
        }
    }

    const A: ChannelId = ChannelId::Electrode(0);
    const B: ChannelId = ChannelId::Electrode(1);
    const C: ChannelId = ChannelId::Electrode(2);

    #[test]
    fn test_indices_follow_enable_order() {
        let mut staged = StagedConfig::default();
        staged.set_enabled(C, true);
        staged.set_enabled(A, true);
        staged.set_enabled(B, true);

        let committed = staged.commit(&device());
        assert_eq!(committed.channels(), &[C, A, B]);
        assert_eq!(committed.channel_index(C), Some(0));
        assert_eq!(committed.channel_index(B), Some(2));
    }

    #[test]
    fn test_reenable_moves_to_end() {
        let mut staged = StagedConfig::default();
        staged.set_enabled(A, true);
        staged.set_enabled(B, true);
        staged.set_enabled(A, false);
        staged.set_enabled(A, true);
        assert_eq!(staged.enabled_channels(), vec![B, A]);

        // Enabling twice keeps the original position
        staged.set_enabled(B, true);
        assert_eq!(staged.enabled_channels(), vec![B, A]);
    }

    #[test]
    fn test_gain_and_bias_ignored_without_analog_front_end() {
        let mut staged = StagedConfig::default();
        staged.set_gain(ChannelId::SampleNumber, GainMode::X24);
        staged.set_bias(ChannelId::Accelerometer(Axis::X), Polarity::Both);
        assert_eq!(staged, StagedConfig::default());

        staged.set_gain(A, GainMode::X8);
        staged.set_bias(A, Polarity::Negative);
        let settings = staged.settings(A).unwrap();
        assert_eq!(settings.gain, GainMode::X8);
        assert_eq!(settings.bias, Polarity::Negative);
        assert!(!settings.enabled);
    }

    #[test]
    fn test_disabled_channels_keep_settings_but_get_no_index() {
        let mut staged = StagedConfig::default();
        staged.set_gain(A, GainMode::X12);
        staged.set_enabled(B, true);

        let committed = staged.commit(&device());
        assert_eq!(committed.channel_index(A), None);
        assert_eq!(committed.channel_index(B), Some(0));
        assert_eq!(committed.setup().channels.len(), 2);
    }

    #[test]
    fn test_all_disabled_commits_zero_channels() {
        let committed = StagedConfig::default().commit(&device());
        assert!(committed.is_empty());
        assert_eq!(committed.channel_index(A), None);
    }

    #[test]
    fn test_unsupported_channels_left_out() {
        let mut staged = StagedConfig::default();
        staged.set_enabled(ChannelId::Electrode(12), true);
        staged.set_enabled(ChannelId::Accelerometer(Axis::Z), true);
        staged.set_enabled(ChannelId::SampleNumber, true);

        let committed = staged.commit(&device());
        assert_eq!(committed.channels(), &[ChannelId::SampleNumber]);
    }

    #[test]
    fn test_from_setup_restages_report() {
        let mut staged = StagedConfig::default();
        staged.set_enabled(B, true);
        staged.set_gain(B, GainMode::X4);
        staged.set_impedance(ImpedanceMode::Ac);
        let committed = staged.clone().commit(&device());

        assert_eq!(StagedConfig::from_setup(committed.setup()), staged);
    }
}
