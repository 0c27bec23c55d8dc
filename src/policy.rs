//! Policy gate (component E): the single chokepoint every capture passes
//! through, plus the process-wide THREATCON, clearance and layer-policy
//! tables it reads.

use crate::{
    device::Device,
    error::{Error, Result},
    events::{self, Category, Payload, Severity},
    tempest::TempestState,
};
use once_cell::sync::OnceCell;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU8, Ordering},
    sync::RwLock,
};

/// Process-wide threat-condition level. Numeric ordering (`NORMAL` lowest)
/// is part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Threatcon {
    /// Baseline.
    Normal = 0,
    /// Heightened caution.
    Alpha = 1,
    /// Escalated threat.
    Bravo = 2,
    /// Biometric sensors gated behind `High` emission state.
    Charlie = 3,
    /// Every classified sensor gated behind `High` emission state.
    Delta = 4,
    /// Only `UNCLASSIFIED` sensors permitted.
    Emergency = 5,
}

static THREATCON: AtomicU8 = AtomicU8::new(Threatcon::Normal as u8);

/// Sets the process-wide THREATCON level.
pub fn set_threatcon(level: Threatcon) {
    THREATCON.store(level as u8, Ordering::SeqCst);
}

/// Reads the process-wide THREATCON level.
#[must_use]
pub fn get_threatcon() -> Threatcon {
    match THREATCON.load(Ordering::SeqCst) {
        0 => Threatcon::Normal,
        1 => Threatcon::Alpha,
        2 => Threatcon::Bravo,
        3 => Threatcon::Charlie,
        4 => Threatcon::Delta,
        _ => Threatcon::Emergency,
    }
}

/// A caller's clearance against classification strings. `UNCLASSIFIED` is
/// dominated by every clearance and needs no table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Clearance {
    /// No special clearance; only `UNCLASSIFIED` is dominated.
    None = 0,
    /// Dominates classifications up to and including `SECRET` levels.
    Secret = 1,
    /// Dominates every recognized classification.
    TopSecret = 2,
}

fn classification_rank(classification: &str) -> Option<Clearance> {
    match classification {
        "UNCLASSIFIED" => Some(Clearance::None),
        "SECRET" | "SECRET_BIOMETRIC" => Some(Clearance::Secret),
        "TOP_SECRET" | "TOP_SECRET_BIOMETRIC" => Some(Clearance::TopSecret),
        _ => None,
    }
}

static CLEARANCE_TABLE: OnceCell<RwLock<HashMap<String, Clearance>>> = OnceCell::new();

fn clearance_table() -> &'static RwLock<HashMap<String, Clearance>> {
    CLEARANCE_TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Grants `role` the given clearance for [`check_clearance`] purposes.
pub fn set_role_clearance(role: &str, clearance: Clearance) {
    clearance_table()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(role.to_owned(), clearance);
}

/// Checks whether `role`'s configured clearance dominates `classification`.
///
/// # Errors
///
/// Returns [`Error::AccessDenied`] if the role's clearance does not dominate
/// the classification, or if `classification` is unrecognized.
pub fn check_clearance(role: &str, classification: &str) -> Result<()> {
    let Some(required) = classification_rank(classification) else {
        return Err(Error::AccessDenied(format!("unknown classification `{classification}`")));
    };
    if required == Clearance::None {
        return Ok(());
    }
    let held = clearance_table()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(role)
        .copied()
        .unwrap_or(Clearance::None);
    if held >= required {
        Ok(())
    } else {
        Err(Error::AccessDenied(format!(
            "role `{role}` clearance does not dominate `{classification}`"
        )))
    }
}

/// Per-layer format and emission-state cap, indexed 0..=7.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerPolicy {
    /// Maximum negotiable frame width for this layer.
    pub max_width: u32,
    /// Maximum negotiable frame height for this layer.
    pub max_height: u32,
    /// Minimum required TEMPEST state for this layer, if any.
    pub min_tempest: Option<TempestState>,
}

static LAYER_TABLE: OnceCell<RwLock<HashMap<u8, LayerPolicy>>> = OnceCell::new();

fn layer_table() -> &'static RwLock<HashMap<u8, LayerPolicy>> {
    LAYER_TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Installs (or replaces) the policy for layer `layer` (0..=7).
pub fn set_layer_policy(layer: u8, policy: LayerPolicy) {
    layer_table().write().unwrap_or_else(std::sync::PoisonError::into_inner).insert(layer, policy);
}

fn get_layer_policy(layer: u8) -> Option<LayerPolicy> {
    layer_table().read().unwrap_or_else(std::sync::PoisonError::into_inner).get(&layer).copied()
}

/// Evaluates whether `dev` may proceed with a capture right now, given its
/// role, classification and layer, the current TEMPEST state, and the
/// process-wide THREATCON/clearance/layer tables. `context` is a free-form
/// string used only for the audit event.
///
/// Rules are evaluated in order; the first deny wins:
/// 1. `LOCKDOWN` always denies, unconditionally.
/// 2. The role's clearance must dominate its classification.
/// 3. The negotiated format must not exceed the layer's cap, if any.
/// 4. The TEMPEST state must be at least the layer's floor, if any.
/// 5. THREATCON escalation tightens the floor further for biometric/
///    non-UNCLASSIFIED roles.
///
/// Every invocation emits a `policy_check` event, win or lose. This
/// function is pure given its inputs plus the process-wide tables: it
/// performs no I/O beyond that event emission.
///
/// # Errors
///
/// Returns [`Error::AccessDenied`] with a description of the first rule
/// that denied the request.
pub fn check_capture(dev: &Device, state: TempestState, context: &str) -> Result<()> {
    let result = evaluate(dev, state);
    let rc = result.as_ref().err().map_or(0, |_| -libc::EACCES);
    let severity = if state == TempestState::Lockdown { Severity::Error } else if result.is_err() { Severity::Warn } else { Severity::Info };
    events::emit_simple(
        dev.token(),
        Category::PolicyCheck,
        severity,
        Payload::PolicyCheck { context: context.to_owned(), rc },
    );
    result
}

fn evaluate(dev: &Device, state: TempestState) -> Result<()> {
    // Rule 1: LOCKDOWN trumps everything else.
    if state == TempestState::Lockdown {
        return Err(Error::AccessDenied("TEMPEST state is LOCKDOWN".into()));
    }

    // Rule 2: clearance must dominate classification.
    check_clearance(dev.role(), dev.classification())?;

    let layer_policy = get_layer_policy(dev.layer());
    if let Some(policy) = layer_policy {
        // Rule 3: layer format cap.
        if policy.max_width > 0 || policy.max_height > 0 {
            if let Some((width, height)) = dev.negotiated_resolution() {
                if (policy.max_width > 0 && width > policy.max_width)
                    || (policy.max_height > 0 && height > policy.max_height)
                {
                    return Err(Error::AccessDenied(format!(
                        "negotiated {width}x{height} exceeds layer cap {}x{}",
                        policy.max_width, policy.max_height
                    )));
                }
            }
        }
        // Rule 4: layer emission floor.
        if let Some(min_tempest) = policy.min_tempest {
            if state < min_tempest {
                return Err(Error::AccessDenied(format!(
                    "TEMPEST state {state} below layer floor {min_tempest}"
                )));
            }
        }
    }

    // Rule 5: THREATCON escalation. The three clauses are cumulative, not
    // mutually exclusive — at DELTA or EMERGENCY the CHARLIE floor for
    // biometric roles still applies, it's just dominated by the stricter
    // clause for most roles.
    let threatcon = get_threatcon();
    let is_unclassified = dev.classification() == "UNCLASSIFIED";
    let is_biometric = dev.role().contains("iris") || dev.role().contains("biometric");

    if threatcon >= Threatcon::Charlie && is_biometric && state < TempestState::High {
        return Err(Error::AccessDenied(
            "CHARLIE THREATCON requires state >= HIGH for biometric roles".into(),
        ));
    }
    if threatcon >= Threatcon::Delta && !is_unclassified && state < TempestState::High {
        return Err(Error::AccessDenied(
            "DELTA THREATCON requires state >= HIGH for classified roles".into(),
        ));
    }
    if threatcon >= Threatcon::Emergency && (!is_unclassified || state < TempestState::Low) {
        return Err(Error::AccessDenied(
            "EMERGENCY THREATCON permits only UNCLASSIFIED roles at state >= LOW".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclassified_always_allowed() {
        assert!(check_clearance("generic_webcam", "UNCLASSIFIED").is_ok());
    }

    #[test]
    fn unknown_classification_denies() {
        assert!(check_clearance("anything", "BOGUS").is_err());
    }

    #[test]
    fn secret_requires_granted_clearance() {
        set_threatcon(Threatcon::Normal);
        assert!(check_clearance("iris_scanner_test_1", "SECRET_BIOMETRIC").is_err());
        set_role_clearance("iris_scanner_test_1", Clearance::Secret);
        assert!(check_clearance("iris_scanner_test_1", "SECRET_BIOMETRIC").is_ok());
    }
}
