//! Driver for the E+E HTE501 humidity/temperature sensor, written against
//! the `embedded-hal` I2C and delay traits so any platform bus can carry it.

use core::fmt::Debug;

use embedded_hal::{delay::DelayNs, i2c::I2c};
use log::warn;
use thiserror::Error;

use crate::{sampler::ClimateSensor, types::Climate};

pub const I2C_ADDRESS: u8 = 0x40;
/// Single-shot measurement, high repeatability.
pub const CMD_MEASURE: [u8; 2] = [0x2C, 0x1B];
pub const MEASUREMENT_TIME_MS: u32 = 15;
pub const FRAME_LEN: usize = 6;

#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum FrameError {
    #[error("crc mismatch on {field} word (got {got:#04x}, expected {expected:#04x})")]
    Crc {
        field: &'static str,
        got: u8,
        expected: u8,
    },
    #[error("reading outside sensor range: {temperature_c:.2}C {relative_humidity_pct:.2}%")]
    OutOfRange {
        temperature_c: f64,
        relative_humidity_pct: f64,
    },
}

#[derive(Debug, Error)]
pub enum Hte501Error<E: Debug> {
    #[error("i2c transfer failed: {0:?}")]
    Bus(E),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub struct Hte501<I2C, D> {
    bus: I2C,
    delay: D,
    address: u8,
}

impl<I2C, D> Hte501<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(bus: I2C, delay: D) -> Self {
        Self {
            bus,
            delay,
            address: I2C_ADDRESS,
        }
    }

    /// Triggers one measurement, waits for the conversion and reads the frame.
    pub fn measure(&mut self) -> Result<Climate, Hte501Error<I2C::Error>> {
        self.bus
            .write(self.address, &CMD_MEASURE)
            .map_err(Hte501Error::Bus)?;
        self.delay.delay_ms(MEASUREMENT_TIME_MS);

        let mut frame = [0_u8; FRAME_LEN];
        self.bus
            .read(self.address, &mut frame)
            .map_err(Hte501Error::Bus)?;

        Ok(decode(&frame)?)
    }

    pub fn release(self) -> I2C {
        self.bus
    }
}

impl<I2C, D> ClimateSensor for Hte501<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    fn read(&mut self) -> Option<Climate> {
        match self.measure() {
            Ok(climate) => Some(climate),
            Err(err) => {
                warn!("hte501 read failed: {err}");
                None
            }
        }
    }
}

/// CRC-8, polynomial 0x31, initial value 0xFF.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFF_u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decodes `[T_hi, T_lo, T_crc, RH_hi, RH_lo, RH_crc]`. Both words are in
/// hundredths; temperature is signed.
pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Climate, FrameError> {
    check_word("temperature", [frame[0], frame[1]], frame[2])?;
    check_word("humidity", [frame[3], frame[4]], frame[5])?;

    let temperature_c = f64::from(i16::from_be_bytes([frame[0], frame[1]])) / 100.0;
    let relative_humidity_pct = f64::from(u16::from_be_bytes([frame[3], frame[4]])) / 100.0;

    if !(-40.0..=125.0).contains(&temperature_c) || !(0.0..=100.0).contains(&relative_humidity_pct)
    {
        return Err(FrameError::OutOfRange {
            temperature_c,
            relative_humidity_pct,
        });
    }

    Ok(Climate {
        temperature_c,
        relative_humidity_pct,
    })
}

fn check_word(field: &'static str, word: [u8; 2], got: u8) -> Result<(), FrameError> {
    let expected = crc8(&word);
    if got == expected {
        Ok(())
    } else {
        Err(FrameError::Crc {
            field,
            got,
            expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal::i2c::{ErrorKind, ErrorType, Operation};

    use super::*;

    #[derive(Default)]
    struct FakeBus {
        response: Option<[u8; FRAME_LEN]>,
        writes: Vec<(u8, Vec<u8>)>,
    }

    impl ErrorType for FakeBus {
        type Error = ErrorKind;
    }

    impl I2c for FakeBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), ErrorKind> {
            for operation in operations {
                match operation {
                    Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                    Operation::Read(buffer) => {
                        let response = self.response.ok_or(ErrorKind::Other)?;
                        buffer.copy_from_slice(&response[..buffer.len()]);
                    }
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingDelay {
        total_ns: u64,
    }

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.total_ns += u64::from(ns);
        }
    }

    fn frame(temperature_raw: i16, humidity_raw: u16) -> [u8; FRAME_LEN] {
        let [t_hi, t_lo] = temperature_raw.to_be_bytes();
        let [h_hi, h_lo] = humidity_raw.to_be_bytes();
        [
            t_hi,
            t_lo,
            crc8(&[t_hi, t_lo]),
            h_hi,
            h_lo,
            crc8(&[h_hi, h_lo]),
        ]
    }

    #[test]
    fn crc_reference_vector() {
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
        assert_eq!(crc8(&[]), 0xFF);
    }

    #[test]
    fn decodes_hundredths() {
        let climate = decode(&frame(2150, 4820)).unwrap();

        assert_eq!(climate.temperature_c, 21.5);
        assert_eq!(climate.relative_humidity_pct, 48.2);
    }

    #[test]
    fn decodes_negative_temperature() {
        let climate = decode(&frame(-1025, 9000)).unwrap();

        assert_eq!(climate.temperature_c, -10.25);
    }

    #[test]
    fn rejects_corrupted_humidity_word() {
        let mut bytes = frame(2150, 4820);
        bytes[4] ^= 0x01;

        assert!(matches!(
            decode(&bytes),
            Err(FrameError::Crc {
                field: "humidity",
                ..
            })
        ));
    }

    #[test]
    fn rejects_out_of_range_humidity() {
        assert!(matches!(
            decode(&frame(2000, 10_500)),
            Err(FrameError::OutOfRange { .. })
        ));
    }

    #[test]
    fn driver_issues_measurement_and_waits() {
        let bus = FakeBus {
            response: Some(frame(2150, 4820)),
            ..Default::default()
        };
        let mut sensor = Hte501::new(bus, CountingDelay::default());

        let climate = sensor.read().unwrap();

        assert_eq!(climate.relative_humidity_pct, 48.2);
        assert!(sensor.delay.total_ns >= u64::from(MEASUREMENT_TIME_MS) * 1_000_000);
        assert_eq!(
            sensor.release().writes,
            vec![(I2C_ADDRESS, CMD_MEASURE.to_vec())]
        );
    }

    #[test]
    fn bus_failure_yields_no_reading() {
        let mut sensor = Hte501::new(FakeBus::default(), CountingDelay::default());

        assert!(matches!(sensor.measure(), Err(Hte501Error::Bus(ErrorKind::Other))));
        assert_eq!(sensor.read(), None);
    }

    #[test]
    fn corrupted_frame_yields_no_reading() {
        let mut bytes = frame(2150, 4820);
        bytes[2] ^= 0xFF;
        let mut sensor = Hte501::new(
            FakeBus {
                response: Some(bytes),
                ..Default::default()
            },
            CountingDelay::default(),
        );

        assert_eq!(sensor.read(), None);
    }
}
