//! pool.rs — simulated pool chemistry and the device-side status payload.
//!
//! The simulated IntelliChem holds a plausible pool state, drifts it
//! gently between polls (pH toward its setpoint while "dosing", ORP
//! likewise, plus measurement noise) and renders it into the 41-byte
//! status payload the bridge decodes.

use intellichem_proto::status::STATUS_PAYLOAD_LEN;
use intellichem_proto::ChemSettings;
use rand::Rng;
use serde::Deserialize;

// ── Scenario config (config.toml) ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChemistryConfig {
    pub ph: f32,
    pub ph_setpoint: f32,
    pub orp: u16,
    pub orp_setpoint: u16,
    pub ph_tank_level: u8,
    pub orp_tank_level: u8,
    pub calcium_hardness: u16,
    pub cyanuric_acid: u8,
    pub alkalinity: u16,
    pub salt_level: u16,
    pub temperature: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Seconds per drift step
    pub step_secs: u64,
    /// Max random pH wobble per step (hundredths)
    pub ph_noise: f32,
    /// Max random ORP wobble per step (mV)
    pub orp_noise: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FullConfig {
    pub chemistry: ChemistryConfig,
    pub simulation: SimulationConfig,
}

// ── Simulated device ──────────────────────────────────────────────────────────

pub struct PoolSim {
    pub ph: f32,
    pub ph_setpoint: f32,
    pub orp: u16,
    pub orp_setpoint: u16,
    pub ph_tank_level: u8,
    pub orp_tank_level: u8,
    pub calcium_hardness: u16,
    pub cyanuric_acid: u8,
    pub alkalinity: u16,
    pub salt_level: u16,
    pub temperature: u8,
    pub ph_dose_time_s: u16,
    pub orp_dose_time_s: u16,
    ph_noise: f32,
    orp_noise: u16,
}

impl PoolSim {
    pub fn new(cfg: &FullConfig) -> Self {
        let c = &cfg.chemistry;
        Self {
            ph: c.ph,
            ph_setpoint: c.ph_setpoint,
            orp: c.orp,
            orp_setpoint: c.orp_setpoint,
            ph_tank_level: c.ph_tank_level,
            orp_tank_level: c.orp_tank_level,
            calcium_hardness: c.calcium_hardness,
            cyanuric_acid: c.cyanuric_acid,
            alkalinity: c.alkalinity,
            salt_level: c.salt_level,
            temperature: c.temperature,
            ph_dose_time_s: 0,
            orp_dose_time_s: 0,
            ph_noise: cfg.simulation.ph_noise,
            orp_noise: cfg.simulation.orp_noise,
        }
    }

    pub fn ph_dosing(&self) -> bool {
        self.ph_tank_level > 0 && self.ph > self.ph_setpoint + 0.02
    }

    pub fn orp_dosing(&self) -> bool {
        self.orp_tank_level > 0 && self.orp < self.orp_setpoint.saturating_sub(5)
    }

    /// One drift step: nudge readings toward their setpoints while the
    /// relevant doser is active, then add measurement noise.
    pub fn step(&mut self) {
        let mut rng = rand::thread_rng();

        if self.ph_dosing() {
            self.ph -= 0.01;
            self.ph_dose_time_s = self.ph_dose_time_s.saturating_add(1);
        } else {
            self.ph_dose_time_s = 0;
        }
        if self.orp_dosing() {
            self.orp = self.orp.saturating_add(2);
            self.orp_dose_time_s = self.orp_dose_time_s.saturating_add(1);
        } else {
            self.orp_dose_time_s = 0;
        }

        self.ph += rng.gen_range(-self.ph_noise..=self.ph_noise);
        self.ph = self.ph.clamp(6.0, 9.0);
        let wobble = i32::from(rng.gen_range(0..=self.orp_noise * 2)) - i32::from(self.orp_noise);
        self.orp = (i32::from(self.orp) + wobble).clamp(200, 900) as u16;
    }

    /// Accept a config write, as the device stores it.
    pub fn apply_config(&mut self, s: &ChemSettings) {
        self.ph_setpoint = s.ph_setpoint;
        self.orp_setpoint = s.orp_setpoint;
        self.ph_tank_level = s.ph_tank_level.min(7);
        self.orp_tank_level = s.orp_tank_level.min(7);
        self.calcium_hardness = s.calcium_hardness;
        self.cyanuric_acid = s.cyanuric_acid;
        self.alkalinity = s.alkalinity;
    }

    /// A rough Langelier index from the current chemistry, sign-magnitude
    /// encoded the way the device reports it.
    fn lsi_byte(&self) -> u8 {
        let lsi = (self.ph - 7.5) + (f32::from(self.alkalinity) - 100.0) / 400.0;
        let hundredths = (lsi * 100.0).round().clamp(-99.0, 99.0) as i32;
        if hundredths < 0 {
            (256 + hundredths) as u8
        } else {
            hundredths as u8
        }
    }

    /// Render the device-side status payload the bridge decodes.
    pub fn status_payload(&self) -> [u8; STATUS_PAYLOAD_LEN] {
        let mut p = [0u8; STATUS_PAYLOAD_LEN];

        let ph_raw = (self.ph * 100.0).round() as u16;
        let ph_set = (self.ph_setpoint * 100.0).round() as u16;
        p[0..2].copy_from_slice(&ph_raw.to_be_bytes());
        p[2..4].copy_from_slice(&self.orp.to_be_bytes());
        p[4..6].copy_from_slice(&ph_set.to_be_bytes());
        p[6..8].copy_from_slice(&self.orp_setpoint.to_be_bytes());
        p[10..12].copy_from_slice(&self.ph_dose_time_s.to_be_bytes());
        p[14..16].copy_from_slice(&self.orp_dose_time_s.to_be_bytes());
        // Dose volume ≈ 2 mL/s of pump time
        p[16..18].copy_from_slice(&self.ph_dose_time_s.saturating_mul(2).to_be_bytes());
        p[18..20].copy_from_slice(&self.orp_dose_time_s.saturating_mul(2).to_be_bytes());
        // Tank levels report raw 1–7 when a tank is fitted
        p[20] = self.ph_tank_level + 1;
        p[21] = self.orp_tank_level + 1;
        p[22] = self.lsi_byte();
        p[23..25].copy_from_slice(&self.calcium_hardness.to_be_bytes());
        p[26] = self.cyanuric_acid;
        p[27..29].copy_from_slice(&self.alkalinity.to_be_bytes());
        p[29] = (self.salt_level / 50) as u8;
        p[31] = self.temperature;

        // Alarms: empty-tank bits only; flow is always detected on the bench
        let mut alarms = 0u8;
        if self.ph_tank_level == 0 {
            alarms |= 0x20;
        }
        if self.orp_tank_level == 0 {
            alarms |= 0x40;
        }
        p[32] = alarms;

        // Dosing register: peristaltic dosers fitted (type 1), statuses from
        // the drift model (0 = dosing, 1 = monitoring)
        let ph_status: u8 = if self.ph_dosing() { 0 } else { 1 };
        let orp_status: u8 = if self.orp_dosing() { 0 } else { 1 };
        p[34] = 0b0101 | (ph_status << 4) | (orp_status << 6);

        p[36] = 80; // firmware 1.080
        p[37] = 1;

        let balance = self.lsi_byte();
        p[38] = if balance == 0 {
            0
        } else if balance & 0x80 != 0 {
            1 // negative LSI → corrosive
        } else {
            2
        };
        p
    }
}
