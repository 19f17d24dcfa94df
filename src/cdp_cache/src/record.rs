use crate::codec::{write_varint, Reader};
use crate::numeric::Ratio;
use crate::CdpError;
use candid::CandidType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registration id of an account: the block height and transaction index
/// where the account was registered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegId {
    pub height: u32,
    pub index: u16,
}

impl RegId {
    pub const MAX: RegId = RegId {
        height: u32::MAX,
        index: u16::MAX,
    };

    pub const fn new(height: u32, index: u16) -> Self {
        Self { height, index }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_varint(buf, u64::from(self.height));
        write_varint(buf, u64::from(self.index));
    }

    pub fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CdpError> {
        Ok(Self {
            height: reader.read_varint_u32()?,
            index: reader.read_varint_u16()?,
        })
    }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.index)
    }
}

/// 256-bit CDP identifier, the hash of the transaction that opened it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CdpId(pub [u8; 32]);

impl CdpId {
    pub const ZERO: CdpId = CdpId([0; 32]);
    pub const MAX: CdpId = CdpId([0xff; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for CdpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identity of a CDP: who owns it and which transaction opened it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CdpIdentity {
    pub owner: RegId,
    pub cdp_id: CdpId,
}

impl CdpIdentity {
    pub fn new(owner: RegId, cdp_id: CdpId) -> Self {
        Self { owner, cdp_id }
    }

    /// Composite store key: `owner ++ cdp_id`.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(42);
        self.owner.encode_into(&mut buf);
        buf.extend_from_slice(&self.cdp_id.0);
        buf
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, CdpError> {
        let mut reader = Reader::new(bytes);
        let owner = RegId::decode_from(&mut reader)?;
        let cdp_id = CdpId(reader.read_array()?);
        reader.finish()?;
        Ok(Self { owner, cdp_id })
    }
}

impl fmt::Display for CdpIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.cdp_id)
    }
}

/// A collateralized debt position: base coins staked against minted stable coins.
///
/// The collateral ratio is derived from the totals on demand and never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CdpRecord {
    pub owner: RegId,
    pub cdp_id: CdpId,
    /// Height of the last block that staked into or minted from this CDP.
    pub last_op_height: u32,
    pub total_staked: u64,
    pub total_owed: u64,
}

impl CdpRecord {
    /// A fresh position with nothing staked or owed yet.
    pub fn new(owner: RegId, cdp_id: CdpId) -> Self {
        Self {
            owner,
            cdp_id,
            ..Default::default()
        }
    }

    /// The not-found marker: a record with the zero cdp id.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cdp_id.is_zero()
    }

    pub fn identity(&self) -> CdpIdentity {
        CdpIdentity::new(self.owner, self.cdp_id)
    }

    pub fn ratio(&self) -> Ratio {
        Ratio::of(self.total_staked, self.total_owed)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.owner.encode_into(&mut buf);
        buf.extend_from_slice(&self.cdp_id.0);
        write_varint(&mut buf, u64::from(self.last_op_height));
        write_varint(&mut buf, self.total_staked);
        write_varint(&mut buf, self.total_owed);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CdpError> {
        let mut reader = Reader::new(bytes);
        let record = Self {
            owner: RegId::decode_from(&mut reader)?,
            cdp_id: CdpId(reader.read_array()?),
            last_op_height: reader.read_varint_u32()?,
            total_staked: reader.read_varint()?,
            total_owed: reader.read_varint()?,
        };
        reader.finish()?;
        Ok(record)
    }
}

impl fmt::Display for CdpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "owner={}, cdp_id={}, last_op_height={}, total_staked={}, total_owed={}, ratio={}",
            self.owner,
            self.cdp_id,
            self.last_op_height,
            self.total_staked,
            self.total_owed,
            self.ratio()
        )
    }
}

/// Read-only projection handed to query consumers.
#[derive(CandidType, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidCdp {
    pub regid: String,
    pub cdp_id: String,
    pub height: u32,
    pub total_bcoin: u64,
    pub total_scoin: u64,
    pub ratio: f64,
}

impl CandidCdp {
    pub fn to_json(&self) -> Result<String, CdpError> {
        serde_json::to_string(self).map_err(|e| CdpError::Decode(e.to_string()))
    }
}

impl From<&CdpRecord> for CandidCdp {
    fn from(cdp: &CdpRecord) -> Self {
        Self {
            regid: cdp.owner.to_string(),
            cdp_id: cdp.cdp_id.to_hex(),
            height: cdp.last_op_height,
            total_bcoin: cdp.total_staked,
            total_scoin: cdp.total_owed,
            ratio: cdp.ratio().to_f64(),
        }
    }
}
