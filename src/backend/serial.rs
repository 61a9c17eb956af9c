use super::{Arc, BackendState, Mutex};
use crate::communication::{DeviceUpdate, Update};
use anyhow::Result;
use crossbeam_channel::Sender;
use saim_control::{CancellationToken, DeviceError, MotorDevice};
use serialport::SerialPort;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const REPLY_TIMEOUT: Duration = Duration::from_millis(2000);
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(20);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn get_available_ports(token: CancellationToken) -> Vec<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            error!("[后端] 无法获取串口列表: {}", e);
            return vec![];
        }
    };
    let mut likely_ports = Vec::new();
    let mut other_ports = Vec::new();

    for p in ports {
        if token.load(Ordering::Relaxed) {
            return vec![];
        }
        let lower_port_name = p.port_name.to_lowercase();
        // 调试口和蓝牙口排在后面
        if lower_port_name.contains("debug") || lower_port_name.contains("bluetooth") {
            other_ports.push(p.port_name);
        } else {
            likely_ports.push(p.port_name);
        }
    }

    info!("串口列表刷新完成");
    likely_ports.extend(other_ports);
    likely_ports
}

/// TIRF angle controller on a serial line.
///
/// Every request is one ASCII line terminated by `\r\n` and answered by one
/// line: `SET <property> <value>` is acknowledged with `OK`, `BUSY <device>?`
/// with `1` while moving and `0` once settled.
pub struct SerialMotor<P = Box<dyn SerialPort>> {
    /// Lives as long as the motor so bytes read past a line ending are kept.
    port: BufReader<P>,
    port_name: String,
    device: String,
    poll_interval: Duration,
    settle_timeout: Duration,
}

impl SerialMotor {
    pub fn open(port_name: &str, baud_rate: u32, device: &str) -> Result<Self, DeviceError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(REPLY_TIMEOUT)
            .open()
            .map_err(|e| DeviceError::Io(format!("打开 {} 失败: {}", port_name, e)))?;
        Ok(Self::from_port(port, port_name, device))
    }
}

impl<P: Read + Write> SerialMotor<P> {
    fn from_port(port: P, port_name: &str, device: &str) -> Self {
        Self {
            port: BufReader::new(port),
            port_name: port_name.to_string(),
            device: device.to_string(),
            poll_interval: BUSY_POLL_INTERVAL,
            settle_timeout: SETTLE_TIMEOUT,
        }
    }

    fn transact(&mut self, request: &str) -> Result<String, DeviceError> {
        debug!("{} <- {}", self.port_name, request);
        self.port
            .get_mut()
            .write_all(format!("{}\r\n", request).as_bytes())
            .map_err(|e| DeviceError::Io(e.to_string()))?;

        let mut response_buffer = String::new();
        match self.port.read_line(&mut response_buffer) {
            Ok(0) => Err(DeviceError::Io("串口已关闭".to_string())),
            Ok(_) => {
                let reply = response_buffer.trim().to_string();
                debug!("{} -> {}", self.port_name, reply);
                Ok(reply)
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                Err(DeviceError::Io(format!("等待 {} 回复超时", self.port_name)))
            }
            Err(e) => Err(DeviceError::Io(e.to_string())),
        }
    }

    fn check_device(&self, device: &str) -> Result<(), DeviceError> {
        if device == self.device {
            Ok(())
        } else {
            Err(DeviceError::UnknownDevice(device.to_string()))
        }
    }
}

impl<P: Read + Write> MotorDevice for SerialMotor<P> {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn set_position(&mut self, device: &str, property: &str, value: i64) -> Result<(), DeviceError> {
        self.check_device(device)?;
        let reply = self.transact(&format!("SET {} {}", property, value))?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(DeviceError::Rejected {
                device: device.to_string(),
                reason: reply,
            })
        }
    }

    fn wait_for_settle(&mut self, device: &str) -> Result<(), DeviceError> {
        self.check_device(device)?;
        let started = Instant::now();
        loop {
            match self.transact(&format!("BUSY {}?", device))?.as_str() {
                "0" => return Ok(()),
                "1" => {}
                other => {
                    return Err(DeviceError::Rejected {
                        device: device.to_string(),
                        reason: format!("无法识别的忙状态回复: {}", other),
                    })
                }
            }
            if started.elapsed() >= self.settle_timeout {
                return Err(DeviceError::SettleTimeout {
                    device: device.to_string(),
                    timeout_ms: self.settle_timeout.as_millis() as u64,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}

pub fn connect(
    state: &Arc<Mutex<BackendState>>,
    port_name: String,
    baud_rate: u32,
    device: &str,
    tx: &Sender<Update>,
) -> Result<()> {
    info!("尝试连接到串口 {} @ {} 波特率", port_name, baud_rate);

    // 先断开任何现有连接
    state.lock().devices.motor = None;

    let motor = SerialMotor::open(&port_name, baud_rate, device)?;
    state.lock().devices.motor = Some(Arc::new(Mutex::new(Box::new(motor))));
    tx.send(Update::Device(DeviceUpdate::MotorStatus(Some(port_name))))?;
    info!("连接成功");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Replays canned controller output and records what was sent.
    struct ScriptedPort {
        replies: Cursor<Vec<u8>>,
        sent: Vec<u8>,
    }

    impl ScriptedPort {
        fn new(replies: &str) -> Self {
            Self {
                replies: Cursor::new(replies.as_bytes().to_vec()),
                sent: Vec::new(),
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.replies.read(buf)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn motor(replies: &str) -> SerialMotor<ScriptedPort> {
        let mut motor = SerialMotor::from_port(ScriptedPort::new(replies), "COM7", "TITIRF");
        motor.poll_interval = Duration::ZERO;
        motor
    }

    #[test]
    fn replies_arriving_together_are_all_consumed() {
        // 两条回复在同一次读取中到达
        let mut motor = motor("OK\r\n1\r\n0\r\n");
        motor.set_position("TITIRF", "Position", -95).unwrap();
        motor.wait_for_settle("TITIRF").unwrap();
        let sent = String::from_utf8(motor.port.get_ref().sent.clone()).unwrap();
        assert_eq!(sent, "SET Position -95\r\nBUSY TITIRF?\r\nBUSY TITIRF?\r\n");
    }

    #[test]
    fn refused_moves_are_device_errors() {
        let mut motor = motor("ERR limit\r\n");
        assert_eq!(
            motor.set_position("TITIRF", "Position", 99999),
            Err(DeviceError::Rejected {
                device: "TITIRF".to_string(),
                reason: "ERR limit".to_string()
            })
        );
    }

    #[test]
    fn other_devices_are_not_addressed() {
        let mut motor = motor("");
        assert_eq!(
            motor.wait_for_settle("Stage"),
            Err(DeviceError::UnknownDevice("Stage".to_string()))
        );
        assert!(motor.port.get_ref().sent.is_empty());
    }

    #[test]
    fn silent_controller_is_reported() {
        let mut motor = motor("");
        assert!(matches!(
            motor.set_position("TITIRF", "Position", 1),
            Err(DeviceError::Io(_))
        ));
    }
}
