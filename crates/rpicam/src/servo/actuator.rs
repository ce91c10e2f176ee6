use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::ServoError;

/// Time a hobby servo needs to reach a new position.
pub const HARDWARE_SETTLE_TIME: Duration = Duration::from_millis(700);

/// PWM signal driving one servo.
pub trait Actuator: Send {
    /// Set the duty cycle in percent of the period.
    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), ServoError>;

    /// Stop driving the servo so it does not jitter while holding.
    fn release(&mut self) -> Result<(), ServoError> {
        self.set_duty_cycle(0.0)
    }

    /// How long to wait after a duty cycle change before releasing.
    fn settle_time(&self) -> Duration {
        HARDWARE_SETTLE_TIME
    }
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), ServoError> {
        (**self).set_duty_cycle(percent)
    }

    fn release(&mut self) -> Result<(), ServoError> {
        (**self).release()
    }

    fn settle_time(&self) -> Duration {
        (**self).settle_time()
    }
}

fn check_percent(percent: f64) -> Result<(), ServoError> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(ServoError::Actuator(format!(
            "duty cycle {percent:.2}% outside of [0, 100]"
        )));
    }
    Ok(())
}

/// Hardware PWM channel exposed through `/sys/class/pwm`.
pub struct SysfsPwm {
    channel_dir: PathBuf,
    period_ns: u64,
}

impl SysfsPwm {
    pub const DEFAULT_CHIP: &'static str = "/sys/class/pwm/pwmchip0";
    pub const DEFAULT_FREQ_HZ: f64 = 50.0;

    /// Export and enable `channel` on `chip` at `freq_hz`.
    pub fn open(chip: &Path, channel: u32, freq_hz: f64) -> Result<Self, ServoError> {
        if freq_hz <= 0.0 {
            return Err(ServoError::Actuator(format!("invalid PWM frequency {freq_hz}")));
        }
        let channel_dir = chip.join(format!("pwm{channel}"));
        if !channel_dir.is_dir() {
            log::debug!("Exporting PWM channel {} on {}", channel, chip.display());
            fs::write(chip.join("export"), channel.to_string())?;
            // udev needs a moment to fix permissions of the new node
            for _ in 0..20 {
                if channel_dir.join("period").exists() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        let pwm = Self {
            channel_dir,
            period_ns: (1e9 / freq_hz).round() as u64,
        };
        pwm.write_attr("duty_cycle", 0)?;
        pwm.write_attr("period", pwm.period_ns)?;
        pwm.write_attr("enable", 1)?;
        Ok(pwm)
    }

    fn write_attr(&self, attr: &str, value: u64) -> Result<(), ServoError> {
        let path = self.channel_dir.join(attr);
        fs::write(&path, value.to_string()).map_err(|e| {
            ServoError::Actuator(format!("failed to write {}: {}", path.display(), e))
        })
    }
}

impl Actuator for SysfsPwm {
    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), ServoError> {
        check_percent(percent)?;
        let duty_ns = (self.period_ns as f64 * percent / 100.0).round() as u64;
        self.write_attr("duty_cycle", duty_ns)
    }
}

impl Drop for SysfsPwm {
    fn drop(&mut self) {
        if let Err(e) = self.write_attr("enable", 0) {
            log::warn!("Failed to disable PWM channel: {}", e);
        }
    }
}

/// Actuator that only records the duty cycles it was given.
///
/// Used for dry runs and tests.
#[derive(Clone, Default)]
pub struct SimulatedActuator {
    duty_log: Arc<Mutex<Vec<f64>>>,
    settle_time: Duration,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Every duty cycle set so far, releases included.
    pub fn duty_log(&self) -> Vec<f64> {
        match self.duty_log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Actuator for SimulatedActuator {
    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), ServoError> {
        check_percent(percent)?;
        log::debug!("[simulated pwm] duty cycle {:.3}%", percent);
        self.duty_log
            .lock()
            .map_err(|_| ServoError::Actuator("duty log poisoned".to_string()))?
            .push(percent);
        Ok(())
    }

    fn settle_time(&self) -> Duration {
        self.settle_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_pwm_writes_attributes() {
        let chip = tempfile::tempdir().unwrap();
        let channel_dir = chip.path().join("pwm0");
        fs::create_dir(&channel_dir).unwrap();

        let mut pwm = SysfsPwm::open(chip.path(), 0, 50.0).unwrap();
        assert_eq!(fs::read_to_string(channel_dir.join("period")).unwrap(), "20000000");
        assert_eq!(fs::read_to_string(channel_dir.join("enable")).unwrap(), "1");

        pwm.set_duty_cycle(7.5).unwrap();
        assert_eq!(
            fs::read_to_string(channel_dir.join("duty_cycle")).unwrap(),
            "1500000"
        );
        pwm.release().unwrap();
        assert_eq!(fs::read_to_string(channel_dir.join("duty_cycle")).unwrap(), "0");

        drop(pwm);
        assert_eq!(fs::read_to_string(channel_dir.join("enable")).unwrap(), "0");
    }

    #[test]
    fn test_rejects_out_of_range_duty() {
        let mut sim = SimulatedActuator::new();
        assert!(sim.set_duty_cycle(101.0).is_err());
        assert!(sim.set_duty_cycle(-0.5).is_err());
        sim.set_duty_cycle(12.5).unwrap();
        sim.release().unwrap();
        assert_eq!(sim.duty_log(), vec![12.5, 0.0]);
    }

    #[test]
    fn test_default_settle_time() {
        let chip = tempfile::tempdir().unwrap();
        fs::create_dir(chip.path().join("pwm1")).unwrap();
        let pwm = SysfsPwm::open(chip.path(), 1, 50.0).unwrap();
        assert_eq!(pwm.settle_time(), HARDWARE_SETTLE_TIME);
        assert_eq!(SimulatedActuator::new().settle_time(), Duration::ZERO);
    }
}
