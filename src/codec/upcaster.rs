//! Upcaster Chain
//!
//! Pure transformations lifting stored payloads from older schema versions
//! forward, applied at decode time until no registered upcaster matches the
//! payload's `(event_type, schema_version)` pair.

use serde_json::Value;

use super::CodecError;

type Transform = Box<dyn Fn(Value) -> Value + Send + Sync>;

/// A single registered schema transformation
pub struct Upcaster {
    source_type: String,
    source_version: i32,
    target_version: i32,
    priority: i32,
    transform: Transform,
}

impl std::fmt::Debug for Upcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upcaster")
            .field("source_type", &self.source_type)
            .field("source_version", &self.source_version)
            .field("target_version", &self.target_version)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Ordered registry of upcasters.
///
/// Candidates for a `(type, version)` pair are picked by descending priority,
/// then registration order. Registered sets are expected to be confluent:
/// any two applicable paths must reach the same terminal version.
#[derive(Debug, Default)]
pub struct UpcasterChain {
    upcasters: Vec<Upcaster>,
    enabled: bool,
}

impl UpcasterChain {
    /// An empty, enabled chain
    pub fn new() -> Self {
        Self {
            upcasters: Vec::new(),
            enabled: true,
        }
    }

    /// A chain that passes payloads through untouched
    pub fn disabled() -> Self {
        Self {
            upcasters: Vec::new(),
            enabled: false,
        }
    }

    /// An empty chain honoring the `upcasting.enabled` knob
    pub fn from_engine(config: &crate::config::EngineConfig) -> Self {
        if config.upcasting_enabled {
            Self::new()
        } else {
            Self::disabled()
        }
    }

    /// Register a transformation at priority 0
    pub fn register<F>(
        &mut self,
        source_type: &str,
        source_version: i32,
        target_version: i32,
        transform: F,
    ) -> Result<(), CodecError>
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.register_with_priority(source_type, source_version, target_version, 0, transform)
    }

    /// Register a transformation with an explicit priority
    pub fn register_with_priority<F>(
        &mut self,
        source_type: &str,
        source_version: i32,
        target_version: i32,
        priority: i32,
        transform: F,
    ) -> Result<(), CodecError>
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        if source_version < 1 || target_version <= source_version {
            return Err(CodecError::InvalidUpcaster {
                event_type: source_type.to_string(),
                source_version,
                target_version,
            });
        }

        self.upcasters.push(Upcaster {
            source_type: source_type.to_string(),
            source_version,
            target_version,
            priority,
            transform: Box::new(transform),
        });

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.upcasters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upcasters.is_empty()
    }

    /// Lift a payload forward until no upcaster matches its current version.
    ///
    /// Returns the terminal `(schema_version, data)` pair.
    pub fn upcast(
        &self,
        event_type: &str,
        mut schema_version: i32,
        mut data: Value,
    ) -> Result<(i32, Value), CodecError> {
        if !self.enabled || self.upcasters.is_empty() {
            return Ok((schema_version, data));
        }

        // Versions strictly increase, so each upcaster applies at most once
        // per decode; running out of steps means a registration bug.
        let mut remaining_steps = self.upcasters.len();

        while let Some(upcaster) = self.find(event_type, schema_version) {
            if remaining_steps == 0 {
                return Err(CodecError::Corrupted {
                    event_type: event_type.to_string(),
                    schema_version,
                    reason: "upcaster chain did not terminate".to_string(),
                });
            }
            remaining_steps -= 1;

            data = (upcaster.transform)(data);
            schema_version = upcaster.target_version;
        }

        Ok((schema_version, data))
    }

    /// Highest-priority match for `(type, version)`; earliest registration
    /// wins ties.
    fn find(&self, event_type: &str, schema_version: i32) -> Option<&Upcaster> {
        let mut best: Option<&Upcaster> = None;
        for candidate in &self.upcasters {
            if candidate.source_type != event_type || candidate.source_version != schema_version {
                continue;
            }
            match best {
                Some(current) if candidate.priority <= current.priority => {}
                _ => best = Some(candidate),
            }
        }
        best
    }
}
