//! Static wire mappings between request types, SAS endpoints and envelope keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The six CBSD actions a Domain Proxy forwards to the SAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestType {
    Registration,
    SpectrumInquiry,
    Grant,
    Heartbeat,
    Relinquishment,
    Deregistration,
}

impl RequestType {
    pub const ALL: [RequestType; 6] = [
        RequestType::Registration,
        RequestType::SpectrumInquiry,
        RequestType::Grant,
        RequestType::Heartbeat,
        RequestType::Relinquishment,
        RequestType::Deregistration,
    ];

    /// Path segment used for both the SAS and the RC-ingest endpoint.
    pub fn api_name(self) -> &'static str {
        match self {
            RequestType::Registration => "registration",
            RequestType::SpectrumInquiry => "spectrumInquiry",
            RequestType::Grant => "grant",
            RequestType::Heartbeat => "heartbeat",
            RequestType::Relinquishment => "relinquishment",
            RequestType::Deregistration => "deregistration",
        }
    }

    pub fn request_key(self) -> &'static str {
        match self {
            RequestType::Registration => "registrationRequest",
            RequestType::SpectrumInquiry => "spectrumInquiryRequest",
            RequestType::Grant => "grantRequest",
            RequestType::Heartbeat => "heartbeatRequest",
            RequestType::Relinquishment => "relinquishmentRequest",
            RequestType::Deregistration => "deregistrationRequest",
        }
    }

    pub fn response_key(self) -> &'static str {
        match self {
            RequestType::Registration => "registrationResponse",
            RequestType::SpectrumInquiry => "spectrumInquiryResponse",
            RequestType::Grant => "grantResponse",
            RequestType::Heartbeat => "heartbeatResponse",
            RequestType::Relinquishment => "relinquishmentResponse",
            RequestType::Deregistration => "deregistrationResponse",
        }
    }

    pub fn from_request_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.request_key() == key)
    }

    pub fn from_response_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.response_key() == key)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// SAS-CBSD protocol response codes. Codes outside the known table are kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    Version,
    Blacklisted,
    MissingParam,
    InvalidValue,
    CertError,
    Deregister,
    RegPending,
    GroupError,
    UnsupportedSpectrum,
    Interference,
    GrantConflict,
    TerminatedGrant,
    SuspendedGrant,
    UnsyncOpParam,
    Unknown(i64),
}

impl ResponseCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ResponseCode::Success,
            100 => ResponseCode::Version,
            101 => ResponseCode::Blacklisted,
            102 => ResponseCode::MissingParam,
            103 => ResponseCode::InvalidValue,
            104 => ResponseCode::CertError,
            105 => ResponseCode::Deregister,
            200 => ResponseCode::RegPending,
            201 => ResponseCode::GroupError,
            300 => ResponseCode::UnsupportedSpectrum,
            400 => ResponseCode::Interference,
            401 => ResponseCode::GrantConflict,
            500 => ResponseCode::TerminatedGrant,
            501 => ResponseCode::SuspendedGrant,
            502 => ResponseCode::UnsyncOpParam,
            other => ResponseCode::Unknown(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::Version => 100,
            ResponseCode::Blacklisted => 101,
            ResponseCode::MissingParam => 102,
            ResponseCode::InvalidValue => 103,
            ResponseCode::CertError => 104,
            ResponseCode::Deregister => 105,
            ResponseCode::RegPending => 200,
            ResponseCode::GroupError => 201,
            ResponseCode::UnsupportedSpectrum => 300,
            ResponseCode::Interference => 400,
            ResponseCode::GrantConflict => 401,
            ResponseCode::TerminatedGrant => 500,
            ResponseCode::SuspendedGrant => 501,
            ResponseCode::UnsyncOpParam => 502,
            ResponseCode::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CbsdState {
    Unregistered,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantState {
    Granted,
    Authorized,
    Unsync,
}
