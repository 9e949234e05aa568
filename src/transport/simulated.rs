//! Simulated transport: every driver must accept a `Simulated` connection
//! variant and return plausible synthetic readings without opening any real
//! device (spec §4.B.2).
//!
//! `SimulatedTransport` never touches hardware. It echoes whatever was last
//! `send`-staged back through `recv` unless a driver registers a canned
//! response for a command prefix, and it can be seeded to produce numeric
//! values in a nominal band with mild uniform noise for read-style commands.
//!
//! It is also status-register aware: a polling driver (MDO34's `BUSY?`, a
//! wireless tester's `STAT:OPER:COND?`) must see its poll clear immediately
//! in simulation rather than run out its real ceiling, and a `SET x` /
//! `x?` pair (MDO34's `MEASU:MEAS1:TYPE <type>` / `MEASU:MEAS1:TYPE?`) must
//! echo back whatever was last set, so the confirmation poll matches on the
//! first try.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

/// A deterministic pseudo-random source so simulated noise is reproducible
/// across test runs without pulling in a `rand` dependency the rest of the
/// crate has no other use for.
#[derive(Clone)]
struct SplitMix64(u64);

impl SplitMix64 {
    fn next_f64(&mut self) -> f64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64
    }
}

pub struct SimulatedTransport {
    model: String,
    rng: SplitMix64,
    nominal: f64,
    noise_band: f64,
    pending: Option<Vec<u8>>,
    /// Last value set by a `KEY value` write, keyed by `KEY`, so a
    /// subsequent `KEY?` query echoes it back (spec §4.B.2).
    set_state: HashMap<String, String>,
}

impl SimulatedTransport {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let seed = model.bytes().fold(0x1234_5678_9ABC_DEF0u64, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(b as u64)
        });
        Self {
            model,
            rng: SplitMix64(seed),
            nominal: 5.0,
            noise_band: 0.02,
            pending: None,
            set_state: HashMap::new(),
        }
    }

    /// Configure the nominal value and uniform noise half-band a measurement
    /// read should fluctuate within (spec §4.B.2: "in the nominal band, with
    /// mild uniform noise").
    pub fn with_nominal(mut self, nominal: f64, noise_band: f64) -> Self {
        self.nominal = nominal;
        self.noise_band = noise_band;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Produce one plausible reading for this model.
    pub fn sample(&mut self) -> f64 {
        let jitter = (self.rng.next_f64() * 2.0 - 1.0) * self.noise_band;
        self.nominal + jitter
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&mut self) -> EngineResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> EngineResult<()> {
        let text = String::from_utf8_lossy(frame).trim().to_string();
        // A `KEY value` write (no trailing `?`) records `value` under `KEY`
        // so a later `KEY?` query echoes it straight back.
        if !text.ends_with('?') {
            if let Some((key, value)) = text.split_once(' ') {
                self.set_state.insert(key.to_uppercase(), value.trim().to_string());
            }
        }
        self.pending = Some(frame.to_vec());
        Ok(())
    }

    async fn recv(&mut self, _timeout: Duration) -> EngineResult<Vec<u8>> {
        let command = self
            .pending
            .take()
            .ok_or_else(|| EngineError::Internal("recv called before send".into()))?;
        let text = String::from_utf8_lossy(&command).trim().to_string();
        let upper = text.to_uppercase();

        if let Some(key) = upper.strip_suffix('?') {
            // A status-register poll (MDO34's `BUSY?`, a wireless tester's
            // `STAT:OPER:COND?`) must read back "not busy"/"ok" immediately
            // in simulation rather than run the real polling ceiling.
            if key.ends_with("BUSY") || key.ends_with("COND") {
                return Ok(b"0".to_vec());
            }
            // A confirmation poll following a `KEY value` write echoes the
            // last value set under that key.
            if let Some(value) = self.set_state.get(key) {
                return Ok(value.clone().into_bytes());
            }
        }

        if upper.contains("READ") || upper.contains("MEAS") || upper.contains('?') {
            let value = self.sample();
            Ok(format!("{value:.6}").into_bytes())
        } else {
            Ok(b"OK".to_vec())
        }
    }
}
