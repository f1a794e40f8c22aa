/// Debounce settings: how many consecutive positive windows confirm an
/// accident, and how many frame cycles after an alert are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub threshold: u32,
    pub cooldown_cycles: u32,
}

/// What one frame cycle produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The window is still filling; nothing was scored.
    Buffering,
    Scored { is_accident: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationState {
    #[default]
    Idle,
    Evaluating,
    Accumulating(u32),
    Cooldown(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: ConfirmationState,
    pub fire: bool,
}

impl ConfirmationState {
    pub fn consecutive_positives(self) -> u32 {
        match self {
            ConfirmationState::Accumulating(n) => n,
            _ => 0,
        }
    }

    pub fn in_cooldown(self) -> bool {
        matches!(self, ConfirmationState::Cooldown(_))
    }

    pub fn step(self, observation: Observation, policy: &ConfirmationPolicy) -> Transition {
        if let ConfirmationState::Cooldown(remaining) = self {
            let remaining = remaining.saturating_sub(1);
            let state = if remaining == 0 {
                ConfirmationState::Evaluating
            } else {
                ConfirmationState::Cooldown(remaining)
            };
            return Transition { state, fire: false };
        }

        match observation {
            Observation::Buffering => Transition {
                state: ConfirmationState::Idle,
                fire: false,
            },
            Observation::Scored { is_accident: false } => Transition {
                state: ConfirmationState::Evaluating,
                fire: false,
            },
            Observation::Scored { is_accident: true } => {
                let count = self.consecutive_positives() + 1;
                if count < policy.threshold {
                    return Transition {
                        state: ConfirmationState::Accumulating(count),
                        fire: false,
                    };
                }
                let state = if policy.cooldown_cycles == 0 {
                    ConfirmationState::Evaluating
                } else {
                    ConfirmationState::Cooldown(policy.cooldown_cycles)
                };
                Transition { state, fire: true }
            }
        }
    }
}
