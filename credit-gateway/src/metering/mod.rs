pub mod modbus_rtu;
pub mod serial;

use std::{path::PathBuf, time::Duration};

pub use modbus_rtu::{ModbusError, ModbusRtu};
pub use serial::SerialPort;

/// Input registers read per sample.
pub const REGISTER_BLOCK_LEN: u16 = 10;

/// Source of instantaneous power readings.
///
/// `read` never fails loudly: any device fault is logged by the
/// implementation and reported as `None`, meaning "skip this tick".
#[async_trait::async_trait]
pub trait PowerMeter: Send {
    async fn read(&mut self) -> Option<f64>;
}

#[derive(thiserror::Error, Debug)]
pub enum MeterError {
    #[error("failed to open meter device {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Modbus(#[from] ModbusError),
    #[error("meter did not answer within {0:?}")]
    Timeout(Duration),
    #[error("register block too short: {0} registers")]
    ShortBlock(usize),
}

/// One decoded PZEM-004T measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub energy_wh: f64,
    pub frequency_hz: f64,
    pub power_factor: f64,
    pub alarm: bool,
}

fn wide(lo: u16, hi: u16) -> f64 {
    f64::from(u32::from(lo) | (u32::from(hi) << 16))
}

/// Decodes the 10-register measurement block.
pub fn decode_registers(regs: &[u16]) -> Result<PowerSample, MeterError> {
    if regs.len() < usize::from(REGISTER_BLOCK_LEN) {
        return Err(MeterError::ShortBlock(regs.len()));
    }
    Ok(PowerSample {
        voltage_v: f64::from(regs[0]) / 10.0,
        current_a: wide(regs[1], regs[2]) / 1000.0,
        power_w: wide(regs[3], regs[4]) / 10.0,
        energy_wh: wide(regs[5], regs[6]),
        frequency_hz: f64::from(regs[7]) / 10.0,
        power_factor: f64::from(regs[8]) / 100.0,
        alarm: regs[9] != 0,
    })
}

/// PZEM-004T energy meter on a 9600 8N1 serial line.
///
/// The device handle is dropped after any failure and reopened on the next
/// read.
pub struct PzemMeter {
    device_path: PathBuf,
    slave: u8,
    timeout: Duration,
    link: Option<ModbusRtu<SerialPort>>,
}

impl PzemMeter {
    pub fn new(device_path: impl Into<PathBuf>, slave: u8, timeout: Duration) -> Self {
        Self {
            device_path: device_path.into(),
            slave,
            timeout,
            link: None,
        }
    }

    async fn open(&self) -> Result<ModbusRtu<SerialPort>, MeterError> {
        let port = SerialPort::open(&self.device_path)
            .await
            .map_err(|source| MeterError::Open {
                path: self.device_path.clone(),
                source,
            })?;
        Ok(ModbusRtu::new(port, self.slave))
    }

    pub async fn sample(&mut self) -> Result<PowerSample, MeterError> {
        let mut link = match self.link.take() {
            Some(link) => link,
            None => self.open().await?,
        };
        let regs = link.read_input_registers(0, REGISTER_BLOCK_LEN).await?;
        self.link = Some(link);
        decode_registers(&regs)
    }
}

#[async_trait::async_trait]
impl PowerMeter for PzemMeter {
    async fn read(&mut self) -> Option<f64> {
        let result = match tokio::time::timeout(self.timeout, self.sample()).await {
            Ok(res) => res,
            Err(_) => {
                self.link = None;
                Err(MeterError::Timeout(self.timeout))
            }
        };

        match result {
            Ok(sample) => {
                tracing::debug!(
                    voltage = sample.voltage_v,
                    current = sample.current_a,
                    power = sample.power_w,
                    "meter sample"
                );
                Some(sample.power_w)
            }
            Err(e) => {
                tracing::warn!(error = %e, device = %self.device_path.display(), "meter read failed");
                None
            }
        }
    }
}
