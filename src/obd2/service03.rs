//! OBD2 services 03 (Show stored DTCs) and 04 (Clear DTCs and stored values)

use automotive_diag::obd2::Obd2Command;

use super::{ObdEngine, ProtocolError, ProtocolResult, reply_messages};
use crate::{
    channel::{ChannelError, Command},
    dtc::{DtcCode, DtcReport, decode_dtc_list},
};

impl ObdEngine {
    /// Reads the MIL status and the stored (confirmed) DTCs
    pub fn read_dtcs(&self) -> ProtocolResult<DtcReport> {
        let status = self.dtc_status()?;
        let codes = self.stored_dtcs()?;
        if codes.len() != status.dtc_count as usize {
            log::debug!(
                "ECU reports {} DTCs but sent {}",
                status.dtc_count,
                codes.len()
            );
        }
        Ok(DtcReport { status, codes })
    }

    /// Reads the stored DTCs (service 03). `NO DATA` means there are none
    pub fn stored_dtcs(&self) -> ProtocolResult<Vec<DtcCode>> {
        let mode: u8 = Obd2Command::Service03.into();
        let cmd = Command::service(mode);
        let resp = self.query(&cmd)?;
        let messages = match reply_messages(&cmd, &resp) {
            Ok(m) => m,
            Err(ProtocolError::NoData { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut codes = Vec::new();
        let mut matched = false;
        // One message per ECU (CAN) or per frame (K-Line / J1850)
        for m in messages.iter().filter(|m| m.first() == Some(&0x43)) {
            matched = true;
            let mut data = &m[1..];
            // CAN replies lead with a DTC count, which makes the payload odd
            if data.len() % 2 == 1 {
                data = &data[1..];
            }
            codes.extend(decode_dtc_list(data));
        }
        if !matched {
            // Lets negative responses surface as such
            super::find_response(&cmd, &messages, mode, None)?;
        }
        Ok(codes)
    }

    /// Clears stored DTCs and turns the MIL off (service 04).
    ///
    /// This is destructive and is never retried. A rejected, empty, erroneous or
    /// missing reply is reported as [ProtocolError::ClearFailed]
    pub fn clear_dtcs(&self) -> ProtocolResult<()> {
        let mode: u8 = Obd2Command::Service04.into();
        let cmd = Command::service(mode);
        let resp = match self.channel().send(&cmd) {
            Ok(r) => r,
            Err(e @ ChannelError::Timeout { .. }) => {
                return Err(ProtocolError::ClearFailed(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let messages =
            reply_messages(&cmd, &resp).map_err(|e| ProtocolError::ClearFailed(e.to_string()))?;
        super::find_response(&cmd, &messages, mode, None)
            .map_err(|e| ProtocolError::ClearFailed(e.to_string()))?;
        log::info!("Stored DTCs cleared");
        Ok(())
    }
}
