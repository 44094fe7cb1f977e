//! Modbus/TCP register connector.
//!
//! Instrument commands are colon-separated strings:
//!
//! - writes: `operation:address:value:unit`, with `value` parsed as JSON
//!   (`true`, `17`, `[1, 2, 3]`)
//! - queries: `operation:address:count:unit`
//!
//! Query replies are JSON lists, e.g. `[230, 231]` for registers or
//! `[true, false]` for coils. Operations this connector does not implement are
//! logged and dropped without touching the wire.
//!
//! Frames follow the Modbus application protocol over TCP:
//!
//! ```text
//! MBAP header (7 bytes)                             PDU
//! ┌──────────────┬─────────────┬────────┬──────┐ ┌──────────┬──────────┐
//! │ transaction  │ protocol=0  │ length │ unit │ │ function │ data ... │
//! │ u16          │ u16         │ u16    │ u8   │ │ u8       │          │
//! └──────────────┴─────────────┴────────┴──────┘ └──────────┴──────────┘
//! ```

use super::{Transport, TransportKind, TransportSettings};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

/// Length of the MBAP header including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Default Modbus/TCP port.
pub const DEFAULT_MODBUS_PORT: u16 = 502;

const FC_READ_COILS: u8 = 0x01;
const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
const FC_READ_INPUT_REGISTERS: u8 = 0x04;
const FC_WRITE_SINGLE_COIL: u8 = 0x05;
const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const MAX_READ_REGISTERS: u16 = 125;
const MAX_READ_COILS: u16 = 2000;
const MAX_WRITE_REGISTERS: usize = 123;

/// A structured register operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    /// FC05
    WriteCoil {
        /// Coil address
        address: u16,
        /// New state
        value: bool,
    },
    /// FC06
    WriteRegister {
        /// Register address
        address: u16,
        /// New value
        value: u16,
    },
    /// FC16
    WriteRegisters {
        /// First register address
        address: u16,
        /// Values, one per register
        values: Vec<u16>,
    },
    /// FC01
    ReadCoils {
        /// First coil address
        address: u16,
        /// Number of coils
        count: u16,
    },
    /// FC03
    ReadHoldingRegisters {
        /// First register address
        address: u16,
        /// Number of registers
        count: u16,
    },
    /// FC04
    ReadInputRegisters {
        /// First register address
        address: u16,
        /// Number of registers
        count: u16,
    },
}

/// Decoded reply of a [`ModbusRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    /// Write confirmed
    Written,
    /// Coil states
    Coils(Vec<bool>),
    /// Register values
    Registers(Vec<u16>),
}

impl ModbusResponse {
    /// Render as the JSON reply handed back to the instrument.
    pub fn to_json(&self) -> String {
        let value = match self {
            ModbusResponse::Written => serde_json::Value::Null,
            ModbusResponse::Coils(c) => serde_json::json!(c),
            ModbusResponse::Registers(r) => serde_json::json!(r),
        };
        value.to_string()
    }
}

/// A parsed instrument command: the request plus its unit id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCommand {
    /// Modbus unit (slave) id
    pub unit: u8,
    /// Operation
    pub request: ModbusRequest,
}

fn split_fields(command: &str) -> Result<[&str; 4]> {
    let fields: Vec<&str> = command.split(':').map(str::trim).collect();
    match fields.as_slice() {
        [op, address, arg, unit] => Ok([*op, *address, *arg, *unit]),
        _ => bail!(
            "Register command '{}' must have 4 colon-separated fields, found {}",
            command,
            fields.len()
        ),
    }
}

fn parse_u16(field: &str, what: &str) -> Result<u16> {
    field
        .parse::<u16>()
        .with_context(|| format!("Invalid {} '{}'", what, field))
}

fn parse_unit(field: &str) -> Result<u8> {
    field
        .parse::<u8>()
        .with_context(|| format!("Invalid unit '{}'", field))
}

impl RegisterCommand {
    /// Parse a write command. `Ok(None)` for operations that are not implemented.
    pub fn parse_write(command: &str) -> Result<Option<Self>> {
        let [op, address, value, unit] = split_fields(command)?;
        let address = parse_u16(address, "address")?;
        let unit = parse_unit(unit)?;
        let value: serde_json::Value = serde_json::from_str(value)
            .with_context(|| format!("Value '{}' is not valid JSON", value))?;

        let request = match op {
            "write_coil" => ModbusRequest::WriteCoil {
                address,
                value: json_to_bool(&value)?,
            },
            "write_register" => ModbusRequest::WriteRegister {
                address,
                value: json_to_u16(&value)?,
            },
            "write_registers" => {
                let values = match &value {
                    serde_json::Value::Array(items) => items
                        .iter()
                        .map(json_to_u16)
                        .collect::<Result<Vec<u16>>>()?,
                    single => vec![json_to_u16(single)?],
                };
                if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
                    bail!("write_registers needs 1 to {} values", MAX_WRITE_REGISTERS);
                }
                ModbusRequest::WriteRegisters { address, values }
            }
            _ => return Ok(None),
        };
        Ok(Some(Self { unit, request }))
    }

    /// Parse a query command. `Ok(None)` for operations that are not implemented.
    pub fn parse_query(command: &str) -> Result<Option<Self>> {
        let [op, address, count, unit] = split_fields(command)?;
        let address = parse_u16(address, "address")?;
        let count = parse_u16(count, "count")?;
        let unit = parse_unit(unit)?;

        let limit = if op == "read_coils" {
            MAX_READ_COILS
        } else {
            MAX_READ_REGISTERS
        };
        let request = match op {
            "read_coils" => ModbusRequest::ReadCoils { address, count },
            "read_holding_registers" => ModbusRequest::ReadHoldingRegisters { address, count },
            "read_input_registers" => ModbusRequest::ReadInputRegisters { address, count },
            _ => return Ok(None),
        };
        if count == 0 || count > limit {
            bail!("{} count must be 1 to {}, got {}", op, limit, count);
        }
        Ok(Some(Self { unit, request }))
    }
}

fn json_to_bool(value: &serde_json::Value) -> Result<bool> {
    match value {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        other => Err(anyhow!("Expected a coil state, got {}", other)),
    }
}

fn json_to_u16(value: &serde_json::Value) -> Result<u16> {
    value
        .as_u64()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| anyhow!("Expected a register value 0..=65535, got {}", value))
}

/// Build the PDU (function code and data) for `request`.
pub fn encode_pdu(request: &ModbusRequest) -> BytesMut {
    let mut pdu = BytesMut::with_capacity(8);
    match request {
        ModbusRequest::WriteCoil { address, value } => {
            pdu.put_u8(FC_WRITE_SINGLE_COIL);
            pdu.put_u16(*address);
            pdu.put_u16(if *value { 0xFF00 } else { 0x0000 });
        }
        ModbusRequest::WriteRegister { address, value } => {
            pdu.put_u8(FC_WRITE_SINGLE_REGISTER);
            pdu.put_u16(*address);
            pdu.put_u16(*value);
        }
        ModbusRequest::WriteRegisters { address, values } => {
            pdu.put_u8(FC_WRITE_MULTIPLE_REGISTERS);
            pdu.put_u16(*address);
            pdu.put_u16(values.len() as u16);
            pdu.put_u8((values.len() * 2) as u8);
            for v in values {
                pdu.put_u16(*v);
            }
        }
        ModbusRequest::ReadCoils { address, count } => {
            pdu.put_u8(FC_READ_COILS);
            pdu.put_u16(*address);
            pdu.put_u16(*count);
        }
        ModbusRequest::ReadHoldingRegisters { address, count } => {
            pdu.put_u8(FC_READ_HOLDING_REGISTERS);
            pdu.put_u16(*address);
            pdu.put_u16(*count);
        }
        ModbusRequest::ReadInputRegisters { address, count } => {
            pdu.put_u8(FC_READ_INPUT_REGISTERS);
            pdu.put_u16(*address);
            pdu.put_u16(*count);
        }
    }
    pdu
}

/// Wrap a PDU in an MBAP header.
pub fn encode_frame(transaction_id: u16, unit: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit);
    frame.put_slice(pdu);
    frame
}

fn function_code(request: &ModbusRequest) -> u8 {
    match request {
        ModbusRequest::WriteCoil { .. } => FC_WRITE_SINGLE_COIL,
        ModbusRequest::WriteRegister { .. } => FC_WRITE_SINGLE_REGISTER,
        ModbusRequest::WriteRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        ModbusRequest::ReadCoils { .. } => FC_READ_COILS,
        ModbusRequest::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
        ModbusRequest::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
    }
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        _ => "unknown exception",
    }
}

/// Decode a response PDU for `request`.
pub fn decode_pdu(request: &ModbusRequest, pdu: &[u8]) -> Result<ModbusResponse> {
    let mut buf = pdu;
    if buf.remaining() < 1 {
        bail!("Empty Modbus response");
    }
    let fc = buf.get_u8();
    let expected = function_code(request);
    if fc == expected | 0x80 {
        let code = if buf.has_remaining() { buf.get_u8() } else { 0 };
        bail!(
            "Modbus exception 0x{:02X} ({}) for function 0x{:02X}",
            code,
            exception_name(code),
            expected
        );
    }
    if fc != expected {
        bail!(
            "Unexpected function code 0x{:02X}, expected 0x{:02X}",
            fc,
            expected
        );
    }

    match request {
        ModbusRequest::WriteCoil { .. }
        | ModbusRequest::WriteRegister { .. }
        | ModbusRequest::WriteRegisters { .. } => {
            if buf.remaining() < 4 {
                bail!("Truncated write confirmation");
            }
            Ok(ModbusResponse::Written)
        }
        ModbusRequest::ReadCoils { count, .. } => {
            if buf.remaining() < 1 {
                bail!("Truncated coil response");
            }
            let byte_count = buf.get_u8() as usize;
            if buf.remaining() < byte_count || byte_count * 8 < *count as usize {
                bail!("Coil response too short for {} coils", count);
            }
            let bits = &buf[..byte_count];
            let coils = (0..*count as usize)
                .map(|i| bits[i / 8] & (1 << (i % 8)) != 0)
                .collect();
            Ok(ModbusResponse::Coils(coils))
        }
        ModbusRequest::ReadHoldingRegisters { count, .. }
        | ModbusRequest::ReadInputRegisters { count, .. } => {
            if buf.remaining() < 1 {
                bail!("Truncated register response");
            }
            let byte_count = buf.get_u8() as usize;
            if buf.remaining() < byte_count || byte_count != *count as usize * 2 {
                bail!("Register response has {} bytes for {} registers", byte_count, count);
            }
            let registers = (0..*count).map(|_| buf.get_u16()).collect();
            Ok(ModbusResponse::Registers(registers))
        }
    }
}

/// Modbus/TCP connector.
pub struct ModbusAdapter {
    stream: Option<TcpStream>,
    peer: String,
    transaction_id: u16,
    timeout: Duration,
}

impl ModbusAdapter {
    /// Unconnected adapter.
    pub fn new() -> Self {
        Self {
            stream: None,
            peer: String::new(),
            transaction_id: 0,
            timeout: super::DEFAULT_TIMEOUT,
        }
    }

    async fn transact(&mut self, command: &RegisterCommand) -> Result<ModbusResponse> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let frame = encode_frame(tid, command.unit, &encode_pdu(&command.request));
        let timeout = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("Modbus connection is not open"))?;

        let exchange = async {
            stream
                .write_all(&frame)
                .await
                .context("Failed to send Modbus request")?;

            let mut header = [0u8; MBAP_HEADER_LEN];
            stream
                .read_exact(&mut header)
                .await
                .context("Failed to read MBAP header")?;
            let mut h = &header[..];
            let reply_tid = h.get_u16();
            let protocol = h.get_u16();
            let length = h.get_u16() as usize;
            if protocol != 0 || length < 2 {
                bail!("Malformed MBAP header {:02X?}", header);
            }
            let mut pdu = vec![0u8; length - 1];
            stream
                .read_exact(&mut pdu)
                .await
                .context("Failed to read Modbus PDU")?;
            if reply_tid != tid {
                bail!("Transaction id mismatch: sent {}, got {}", tid, reply_tid);
            }
            Ok::<Vec<u8>, anyhow::Error>(pdu)
        };
        let pdu = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| anyhow!("Modbus request timed out after {:?}", timeout))??;
        decode_pdu(&command.request, &pdu)
    }
}

impl Default for ModbusAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ModbusAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Modbus
    }

    async fn open(&mut self, settings: &TransportSettings) -> Result<()> {
        let mut target = settings.clone();
        target.default_port = settings.default_port.or(Some(DEFAULT_MODBUS_PORT));
        let (host, port) = target.socket_target()?;
        self.timeout = settings.io_timeout();

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| anyhow!("Connecting to {}:{} timed out", host, port))?
            .with_context(|| format!("Failed to connect to Modbus server {}:{}", host, port))?;
        stream.set_nodelay(true)?;
        self.peer = format!("{}:{}", host, port);
        self.stream = Some(stream);
        debug!("Opened Modbus connection to {}", self.peer);
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let Some(parsed) = RegisterCommand::parse_write(command)? else {
            error!(
                "Modbus write '{}' is not implemented (supported: write_coil, write_register, write_registers)",
                command
            );
            return Ok(());
        };
        self.transact(&parsed).await?;
        Ok(())
    }

    async fn query(&mut self, command: &str, _delay: Option<Duration>) -> Result<Option<String>> {
        let Some(parsed) = RegisterCommand::parse_query(command)? else {
            error!(
                "Modbus query '{}' is not implemented (supported: read_coils, read_holding_registers, read_input_registers)",
                command
            );
            return Ok(None);
        };
        let response = self.transact(&parsed).await?;
        Ok(Some(response.to_json()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed Modbus connection to {}", self.peer);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_write_commands() {
        assert_eq!(
            RegisterCommand::parse_write("write_coil:16:true:1").unwrap(),
            Some(RegisterCommand {
                unit: 1,
                request: ModbusRequest::WriteCoil {
                    address: 16,
                    value: true
                }
            })
        );
        assert_eq!(
            RegisterCommand::parse_write("write_registers:100:[1, 2, 3]:0")
                .unwrap()
                .map(|c| c.request),
            Some(ModbusRequest::WriteRegisters {
                address: 100,
                values: vec![1, 2, 3]
            })
        );
        assert!(RegisterCommand::parse_write("write_register:1:70000:0").is_err());
        assert!(RegisterCommand::parse_write("write_coil:1:true").is_err());
    }

    #[test]
    fn test_unsupported_operations_parse_to_none() {
        assert_eq!(RegisterCommand::parse_write("mask_write:1:0:1").unwrap(), None);
        assert_eq!(RegisterCommand::parse_query("read_fifo:1:1:1").unwrap(), None);
    }

    #[test]
    fn test_frame_layout() {
        let pdu = encode_pdu(&ModbusRequest::ReadHoldingRegisters {
            address: 0x006B,
            count: 3,
        });
        let frame = encode_frame(0x0001, 0x11, &pdu);
        assert_eq!(
            &frame[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[test]
    fn test_decode_registers_and_coils() {
        let request = ModbusRequest::ReadInputRegisters {
            address: 0,
            count: 2,
        };
        let reply = decode_pdu(&request, &[0x04, 0x04, 0x00, 0xE6, 0x00, 0xE7]).unwrap();
        assert_eq!(reply, ModbusResponse::Registers(vec![230, 231]));
        assert_eq!(reply.to_json(), "[230,231]");

        let request = ModbusRequest::ReadCoils {
            address: 0,
            count: 3,
        };
        let reply = decode_pdu(&request, &[0x01, 0x01, 0b0000_0101]).unwrap();
        assert_eq!(reply, ModbusResponse::Coils(vec![true, false, true]));
    }

    #[test]
    fn test_decode_exception() {
        let request = ModbusRequest::WriteRegister {
            address: 9,
            value: 1,
        };
        let err = decode_pdu(&request, &[0x86, 0x02]).unwrap_err();
        assert!(err.to_string().contains("illegal data address"));
    }

    /// Answers every request with two holding registers, echoing the transaction id.
    async fn spawn_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            while stream.read_exact(&mut request).await.is_ok() {
                let tid = u16::from_be_bytes([request[0], request[1]]);
                let pdu = [0x03, 0x04, 0x01, 0x02, 0x03, 0x04];
                let frame = encode_frame(tid, request[6], &pdu);
                stream.write_all(&frame).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn test_query_over_tcp() {
        let port = spawn_server().await;
        let mut adapter = ModbusAdapter::new();
        adapter
            .open(&TransportSettings::new(format!("127.0.0.1:{}", port)))
            .await
            .unwrap();
        let reply = adapter
            .query("read_holding_registers:0:2:1", None)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("[258,772]"));

        let dropped = adapter.query("read_fifo:0:2:1", None).await.unwrap();
        assert_eq!(dropped, None);
    }
}
