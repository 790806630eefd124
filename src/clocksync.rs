// src/clocksync.rs
// Continuous estimate of one MCU's free-running counter as an affine
// function of host monotonic time. Each get_clock exchange yields a host
// send/receive interval and an MCU tick; samples update a decay-weighted
// linear regression, gated by the observed round-trip time and an outlier
// filter on the prediction variance. The session layer feeds samples in;
// this module only does the math.

use log::{debug, info};

/// Ageing allowance on the minimum observed half-RTT (seconds per second).
const RTT_AGE: f64 = 0.000010 / (60.0 * 60.0);
/// Exponential decay factor of the regression averages.
const DECAY: f64 = 1.0 / 30.0;
/// Sustained residual window before drift is declared fatal.
const DRIFT_SUSTAIN: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEstimate {
    /// Host time of the estimate's anchor sample.
    pub origin_host: f64,
    /// MCU clock at the anchor.
    pub origin_mcu: f64,
    /// Estimated MCU ticks per host second; always positive.
    pub freq: f64,
}

pub struct ClockSync {
    mcu_freq: f64,
    last_clock: u64,
    est: ClockEstimate,

    min_half_rtt: f64,
    min_rtt_time: f64,

    time_avg: f64,
    time_variance: f64,
    clock_avg: f64,
    clock_covariance: f64,

    prediction_variance: f64,
    last_prediction_time: f64,

    samples: u32,
    drift_since: Option<f64>,
}

impl ClockSync {
    pub fn new(mcu_freq: f64) -> Self {
        ClockSync {
            mcu_freq,
            last_clock: 0,
            est: ClockEstimate {
                origin_host: 0.0,
                origin_mcu: 0.0,
                freq: mcu_freq,
            },
            min_half_rtt: f64::INFINITY,
            min_rtt_time: 0.0,
            time_avg: 0.0,
            time_variance: 0.0,
            clock_avg: 0.0,
            clock_covariance: 0.0,
            prediction_variance: 0.0,
            last_prediction_time: 0.0,
            samples: 0,
            drift_since: None,
        }
    }

    pub fn mcu_freq(&self) -> f64 {
        self.mcu_freq
    }

    pub fn estimate(&self) -> ClockEstimate {
        self.est
    }

    /// Seed the estimator from the first exchange.
    pub fn prime(&mut self, clock32: u32, sent_time: f64) {
        self.last_clock = clock32 as u64;
        self.clock_avg = self.last_clock as f64;
        self.time_avg = sent_time;
        self.est = ClockEstimate {
            origin_host: sent_time,
            origin_mcu: self.clock_avg,
            freq: self.mcu_freq,
        };
        self.prediction_variance = (0.001 * self.mcu_freq).powi(2);
        self.last_prediction_time = -9999.0;
        self.samples = 1;
    }

    /// Feed one get_clock exchange: the MCU's 32-bit reading and the host
    /// send/receive interval bracketing it.
    pub fn record_sample(&mut self, clock32: u32, sent_time: f64, receive_time: f64) {
        if self.samples == 0 {
            self.prime(clock32, sent_time);
            return;
        }
        self.samples += 1;
        let clock = self.clock32_to_clock64(clock32);
        self.last_clock = clock;

        let half_rtt = 0.5 * (receive_time - sent_time);
        let aged_rtt = (sent_time - self.min_rtt_time) * RTT_AGE;
        if half_rtt < self.min_half_rtt + aged_rtt {
            self.min_half_rtt = half_rtt;
            self.min_rtt_time = sent_time;
            debug!(
                "clocksync: new minimum rtt {:.3}: hrtt={:.6} freq={:.0}",
                sent_time, half_rtt, self.est.freq
            );
        }

        // Filter extreme outliers against the running prediction.
        let expected = (sent_time - self.time_avg) * self.est.freq + self.clock_avg;
        let clock_diff2 = (clock as f64 - expected).powi(2);
        if clock_diff2 > 25.0 * self.prediction_variance
            && clock_diff2 > (0.000500 * self.mcu_freq).powi(2)
        {
            self.drift_since.get_or_insert(sent_time);
            if clock as f64 > expected && sent_time < self.last_prediction_time + 10.0 {
                debug!(
                    "clocksync: ignoring sample {:.3}: diff={:.0} stddev={:.3}",
                    sent_time,
                    clock as f64 - expected,
                    self.prediction_variance.sqrt()
                );
                return;
            }
            info!(
                "clocksync: resetting prediction variance {:.3}: diff={:.0}",
                sent_time,
                clock as f64 - expected
            );
            self.prediction_variance = (0.001 * self.mcu_freq).powi(2);
        } else {
            self.drift_since = None;
            self.last_prediction_time = sent_time;
            self.prediction_variance =
                (1.0 - DECAY) * (self.prediction_variance + clock_diff2 * DECAY);
        }

        // Decay-weighted regression of clock against host send time.
        let diff_time = sent_time - self.time_avg;
        self.time_avg += DECAY * diff_time;
        self.time_variance = (1.0 - DECAY) * (self.time_variance + diff_time.powi(2) * DECAY);

        let diff_clock = clock as f64 - self.clock_avg;
        self.clock_avg += DECAY * diff_clock;
        self.clock_covariance =
            (1.0 - DECAY) * (self.clock_covariance + diff_time * diff_clock * DECAY);

        let new_freq = if self.time_variance > 0.0 {
            self.clock_covariance / self.time_variance
        } else {
            self.est.freq
        };
        if new_freq > 0.0 {
            self.est = ClockEstimate {
                origin_host: self.time_avg + self.min_half_rtt.max(0.0).min(1.0),
                origin_mcu: self.clock_avg,
                freq: new_freq,
            };
        }
        debug!(
            "clocksync: regr {:.3}: freq={:.3} d={:.0}({:.3})",
            sent_time,
            self.est.freq,
            clock as f64 - expected,
            self.prediction_variance.sqrt()
        );
    }

    /// Residuals out of tolerance continuously since before `now - 5 s`.
    pub fn drift_exceeded(&self, now: f64) -> bool {
        self.drift_since
            .is_some_and(|since| now - since >= DRIFT_SUSTAIN)
    }

    /// Enough samples for scheduling decisions.
    pub fn is_ready(&self) -> bool {
        self.samples >= 8
    }

    /// Extend a 32-bit MCU reading to 64 bits, choosing the value closest
    /// to the running counter.
    pub fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        let last = self.last_clock;
        let mut diff = clock32 as i64 - (last & 0xffff_ffff) as i64;
        if diff > 0x7fff_ffff {
            diff -= 0x1_0000_0000;
        } else if diff < -0x7fff_ffff {
            diff += 0x1_0000_0000;
        }
        (last as i64 + diff) as u64
    }

    /// Estimated MCU clock at a host time.
    pub fn host_time_to_clock(&self, host_time: f64) -> u64 {
        let ticks = self.est.origin_mcu + (host_time - self.est.origin_host) * self.est.freq;
        if ticks <= 0.0 {
            0
        } else {
            ticks.round() as u64
        }
    }

    /// Host time at which the MCU is expected to reach `clock`.
    pub fn clock_to_host_time(&self, clock: u64) -> f64 {
        (clock as f64 - self.est.origin_mcu) / self.est.freq + self.est.origin_host
    }

    /// Print time is MCU clock scaled by the nominal frequency.
    pub fn print_time_to_clock(&self, print_time: f64) -> u64 {
        let ticks = print_time * self.mcu_freq;
        if ticks <= 0.0 {
            0
        } else {
            ticks.round() as u64
        }
    }

    pub fn clock_to_print_time(&self, clock: u64) -> f64 {
        clock as f64 / self.mcu_freq
    }

    /// The MCU's current print time as seen from the host clock.
    pub fn estimated_print_time(&self, host_time: f64) -> f64 {
        self.clock_to_print_time(self.host_time_to_clock(host_time))
    }

    pub fn dump_debug(&self) -> String {
        format!(
            "clocksync: mcu_freq={:.0} last_clock={} est=({:.3} {:.0} {:.3}) \
             min_half_rtt={:.6} time_avg={:.3}({:.3}) clock_avg={:.3}({:.3}) pred_var={:.3}",
            self.mcu_freq,
            self.last_clock,
            self.est.origin_host,
            self.est.origin_mcu,
            self.est.freq,
            self.min_half_rtt,
            self.time_avg,
            self.time_variance,
            self.clock_avg,
            self.clock_covariance,
            self.prediction_variance
        )
    }

    pub fn stats(&self) -> String {
        format!("freq={:.0}", self.est.freq)
    }
}
