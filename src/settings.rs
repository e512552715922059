use crate::error::ConnectionError;
use crate::types::{SettingsParameter, U31_MAX};
use enum_map::{enum_map, EnumMap};

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 8192;

/// One side's view of the six SETTINGS parameters, starting from the RFC
/// initial values.
#[derive(Debug, Clone)]
pub struct Settings {
    map: EnumMap<SettingsParameter, u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            map: enum_map! {
                SettingsParameter::HeaderTableSize => DEFAULT_HEADER_TABLE_SIZE,
                SettingsParameter::EnablePush => 1,
                SettingsParameter::MaxConcurrentStreams => u32::MAX,
                SettingsParameter::InitialWindowSize => DEFAULT_INITIAL_WINDOW_SIZE,
                SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
                SettingsParameter::MaxHeaderListSize => u32::MAX,
            },
        }
    }
}

impl Settings {
    /// Parameters for the SETTINGS frame a client sends right after the
    /// preface. Push is always disabled.
    #[must_use]
    pub fn client_initial() -> Vec<(SettingsParameter, u32)> {
        vec![
            (SettingsParameter::EnablePush, 0),
            (
                SettingsParameter::MaxConcurrentStreams,
                DEFAULT_MAX_CONCURRENT_STREAMS,
            ),
            (
                SettingsParameter::MaxHeaderListSize,
                DEFAULT_MAX_HEADER_LIST_SIZE,
            ),
        ]
    }

    /// Apply a received SETTINGS payload, validating per-parameter ranges.
    /// Returns the INITIAL_WINDOW_SIZE delta to apply to open streams, if
    /// the parameter changed.
    pub fn apply(
        &mut self,
        params: &[(SettingsParameter, u32)],
    ) -> Result<Option<i64>, ConnectionError> {
        let mut window_delta = None;
        for &(param, value) in params {
            match param {
                SettingsParameter::EnablePush if value > 1 => {
                    return Err(ConnectionError::Protocol("ENABLE_PUSH must be 0 or 1"));
                }
                SettingsParameter::InitialWindowSize if value > U31_MAX => {
                    return Err(ConnectionError::FlowControl(
                        "INITIAL_WINDOW_SIZE above 2^31-1",
                    ));
                }
                SettingsParameter::MaxFrameSize
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) =>
                {
                    return Err(ConnectionError::Protocol("MAX_FRAME_SIZE out of range"));
                }
                _ => {}
            }
            if param == SettingsParameter::InitialWindowSize {
                let old = i64::from(self.map[param]);
                window_delta = Some(i64::from(value) - old);
            }
            self.map[param] = value;
        }
        Ok(window_delta)
    }

    #[must_use]
    pub fn header_table_size(&self) -> u32 {
        self.map[SettingsParameter::HeaderTableSize]
    }

    #[must_use]
    pub fn initial_window_size(&self) -> u32 {
        self.map[SettingsParameter::InitialWindowSize]
    }

    #[must_use]
    pub fn max_frame_size(&self) -> u32 {
        self.map[SettingsParameter::MaxFrameSize]
    }

    #[must_use]
    pub fn max_concurrent_streams(&self) -> u32 {
        self.map[SettingsParameter::MaxConcurrentStreams]
    }

    #[must_use]
    pub fn max_header_list_size(&self) -> u32 {
        self.map[SettingsParameter::MaxHeaderListSize]
    }
}
