//! Registration State Machine
//!
//! Defines the valid transitions of the device registration handshake:
//!
//! ```text
//! Unbound -> SecretEstablished -> StampVerified ---------------> Registered
//!                              \                \-> AwaitingIdentity -/
//!                               \-> DuplicateRejected
//! ```

/// Registration states of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No secret loaded yet
    Unbound,
    /// Secret present, stamp not yet checked against the server
    SecretEstablished { prior_secret: bool },
    /// Stamp accepted (first-boot assertion sent or server stamp matched)
    StampVerified,
    /// Another device holds this MAC/secret pair (terminal)
    DuplicateRejected,
    /// Descriptor received but it still carries the placeholder MAC
    AwaitingIdentity,
    /// Non-placeholder identity confirmed (terminal)
    Registered,
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// Secret read from storage (`existing`) or freshly generated
    SecretLoaded { existing: bool },
    /// Server accepted the stamp or returned a matching one
    StampAccepted,
    /// Server stamp differs, or the server refused the assertion
    StampMismatch,
    /// A device descriptor arrived
    DescriptorReceived { placeholder: bool },
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed (or stayed)
    Success(RegistrationState),
    /// First entry into `Registered`; the runtime should start
    Registered,
    /// Identity conflict; the agent must shut down
    Rejected { reason: String },
    /// Transition was invalid from current state
    Invalid {
        from: RegistrationState,
        event: RegistrationEvent,
    },
}

/// The registration state machine
#[derive(Debug)]
pub struct RegistrationMachine {
    current_state: RegistrationState,
}

impl Default for RegistrationMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationMachine {
    /// Create a new state machine in `Unbound` state
    pub fn new() -> Self {
        Self {
            current_state: RegistrationState::Unbound,
        }
    }

    /// Get current state
    pub fn state(&self) -> RegistrationState {
        self.current_state
    }

    pub fn is_registered(&self) -> bool {
        self.current_state == RegistrationState::Registered
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: RegistrationEvent) -> TransitionResult {
        use RegistrationEvent::*;
        use RegistrationState::*;

        let next = match (self.current_state, &event) {
            (Unbound, SecretLoaded { existing }) => SecretEstablished {
                prior_secret: *existing,
            },

            (SecretEstablished { .. }, StampAccepted) => StampVerified,
            (SecretEstablished { prior_secret }, StampMismatch) => {
                self.current_state = DuplicateRejected;
                let reason = if prior_secret {
                    "server stamp does not match this device's secret"
                } else {
                    "server refused the first-boot stamp"
                };
                return TransitionResult::Rejected {
                    reason: reason.to_string(),
                };
            }

            (StampVerified | AwaitingIdentity, DescriptorReceived { placeholder: true }) => {
                AwaitingIdentity
            }
            (StampVerified | AwaitingIdentity, DescriptorReceived { placeholder: false }) => {
                self.current_state = Registered;
                return TransitionResult::Registered;
            }

            // Registered is terminal; later descriptors supersede the old one
            // without re-entering the state.
            (Registered, DescriptorReceived { .. }) => Registered,

            (from, _) => {
                return TransitionResult::Invalid {
                    from,
                    event: event.clone(),
                }
            }
        };

        self.current_state = next;
        TransitionResult::Success(next)
    }
}
