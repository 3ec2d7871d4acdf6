//! Short-lived HTTP requests against the box's REST service.
//!
//! One bounded GET per call, no retries here: the session decides when to
//! ask again. Identity fetches fail loudly (`InfoUnavailable`); power
//! polls are advisory and collapse every failure into `Unknown`.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::commands::CommandSet;
use super::{DeviceEndpoint, DeviceError, DeviceIdentity, PowerState};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(4);

/// Payload of `GET /as/system/information`. Field names are the firmware's.
#[derive(Debug, Deserialize)]
struct SystemInformation {
    #[serde(rename = "hardwareModel")]
    hardware_model: Option<String>,
    #[serde(rename = "serialNumber")]
    serial_number: Option<String>,
    #[serde(rename = "ASVersion")]
    as_version: Option<String>,
    #[serde(rename = "MACAddress")]
    mac_address: Option<String>,
    #[serde(rename = "activeStandby")]
    active_standby: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct InfoClient {
    http: reqwest::Client,
}

impl InfoClient {
    pub fn new() -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| DeviceError::InfoUnavailable(e.to_string()))?;
        Ok(Self { http })
    }

    async fn system_information(
        &self,
        endpoint: &DeviceEndpoint,
    ) -> Result<SystemInformation, DeviceError> {
        let url = format!(
            "http://{}:{}/as/system/information",
            endpoint.host, endpoint.http_port
        );
        debug!("GET {}", url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DeviceError::InfoUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| DeviceError::InfoUnavailable(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| DeviceError::InfoUnavailable(format!("malformed payload: {e}")))
    }

    /// Fetch model, serial and capability hints. Model and serial are
    /// required; a payload without them counts as malformed.
    pub async fn fetch_identity(
        &self,
        endpoint: &DeviceEndpoint,
    ) -> Result<DeviceIdentity, DeviceError> {
        let info = self.system_information(endpoint).await?;
        let model = info.hardware_model.ok_or_else(|| {
            DeviceError::InfoUnavailable("payload missing hardwareModel".into())
        })?;
        let serial = info.serial_number.ok_or_else(|| {
            DeviceError::InfoUnavailable("payload missing serialNumber".into())
        })?;
        let capabilities = CommandSet::for_model(&model);
        Ok(DeviceIdentity {
            model,
            serial,
            software_version: info.as_version,
            mac_address: info.mac_address,
            capabilities,
        })
    }

    /// Lightweight power poll. Advisory: any failure yields `Unknown`.
    pub async fn fetch_power_state(&self, endpoint: &DeviceEndpoint) -> PowerState {
        match self.system_information(endpoint).await {
            Ok(info) => match info.active_standby {
                Some(true) => PowerState::Standby,
                Some(false) => PowerState::On,
                None => PowerState::Unknown,
            },
            Err(e) => {
                debug!("power poll for {} failed: {}", endpoint.id, e);
                PowerState::Unknown
            }
        }
    }
}
