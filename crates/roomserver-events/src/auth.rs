//! Authorization rules for room events.
//!
//! An event is judged against a small, fixed slice of room state: the
//! create event, the power-level table, the join rules, and the membership
//! and third-party-invite entries for the users involved. Callers expose
//! that state through the [`AuthProvider`] capability trait; the rules
//! never see more of the room than the provider hands out.

use serde_json::Value;
use thiserror::Error;

use crate::event::{Event, TYPE_CREATE, TYPE_MEMBER};

/// Why an event failed authorization.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    /// The room already has a create event, so a second one is forbidden.
    #[error("room is already created")]
    DuplicateCreate,

    /// No create event is known for the room.
    #[error("room has no create event")]
    MissingCreate,

    /// The sender is not joined to the room.
    #[error("sender {0} is not joined to the room")]
    SenderNotJoined(String),

    /// The sender's power level is below what the operation requires.
    #[error("power level {have} is below required level {needed}")]
    InsufficientPowerLevel {
        /// Level required for the operation.
        needed: i64,
        /// Level the sender actually holds.
        have: i64,
    },

    /// A membership change that the rules never permit.
    #[error("membership change {from:?} -> {to} is not allowed")]
    MembershipTransition {
        /// The target's current membership, if any.
        from: Option<String>,
        /// The requested membership.
        to: String,
    },

    /// The room's join rules do not admit the sender.
    #[error("join rules {0:?} do not admit the sender")]
    JoinRulesForbid(String),

    /// A member event without a target state key, or similar shape defect.
    #[error("malformed membership event: {0}")]
    MalformedMembership(&'static str),

    /// A third-party invite was referenced but is not in the room state.
    #[error("unknown third-party invite token {0}")]
    UnknownThirdPartyInvite(String),
}

/// The room state a batch of events needs for authorization.
///
/// Mirrors the shape of the auth rules themselves: three singleton entries
/// plus member / third-party-invite entries keyed by state key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateNeeded {
    /// Whether the create event is needed.
    pub create: bool,
    /// Whether the power-level event is needed.
    pub power_levels: bool,
    /// Whether the join-rules event is needed.
    pub join_rules: bool,
    /// Member state keys (senders and membership targets) that are needed.
    pub member: Vec<String>,
    /// Third-party-invite tokens that are needed.
    pub third_party_invite: Vec<String>,
}

impl StateNeeded {
    /// Compute the state needed to authorize every event in `events`.
    ///
    /// The member and third-party-invite lists are sorted and deduplicated
    /// so they can be fed straight into batched lookups.
    pub fn for_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut needed = Self::default();
        for event in events {
            if event.event_type() == TYPE_CREATE {
                continue;
            }
            needed.create = true;
            needed.power_levels = true;
            needed.member.push(event.sender().to_string());

            if event.event_type() == TYPE_MEMBER {
                needed.join_rules = true;
                if let Some(target) = event.state_key() {
                    needed.member.push(target.to_string());
                }
                if let Some(token) = third_party_invite_token(event.content()) {
                    needed.third_party_invite.push(token.to_string());
                }
            }
        }
        needed.member.sort();
        needed.member.dedup();
        needed.third_party_invite.sort();
        needed.third_party_invite.dedup();
        needed
    }
}

/// The slice of room state consulted by [`allowed`].
pub trait AuthProvider {
    /// The room's create event, if known.
    fn create(&self) -> Option<&Event>;
    /// The room's power-level event, if known.
    fn power_levels(&self) -> Option<&Event>;
    /// The room's join-rules event, if known.
    fn join_rules(&self) -> Option<&Event>;
    /// The membership event for `state_key`, if known.
    fn member(&self, state_key: &str) -> Option<&Event>;
    /// The third-party-invite event for `state_key`, if known.
    fn third_party_invite(&self, state_key: &str) -> Option<&Event>;
}

/// Decide whether `event` is allowed against the state in `auth`.
///
/// Deterministic: the verdict depends only on the event and the provider's
/// answers. Returns `Ok(())` when the event is authorized.
pub fn allowed(event: &Event, auth: &impl AuthProvider) -> Result<(), AuthError> {
    if event.event_type() == TYPE_CREATE {
        return if auth.create().is_some() {
            Err(AuthError::DuplicateCreate)
        } else {
            Ok(())
        };
    }

    let create = auth.create().ok_or(AuthError::MissingCreate)?;

    if event.event_type() == TYPE_MEMBER {
        return member_allowed(event, create, auth);
    }

    require_joined(event.sender(), auth)?;

    let levels = PowerLevels::from(auth, create);
    let needed = levels.required_for(event);
    let have = levels.user_level(event.sender());
    if have < needed {
        return Err(AuthError::InsufficientPowerLevel { needed, have });
    }
    Ok(())
}

fn require_joined(user: &str, auth: &impl AuthProvider) -> Result<(), AuthError> {
    match auth.member(user).and_then(Event::membership) {
        Some("join") => Ok(()),
        _ => Err(AuthError::SenderNotJoined(user.to_string())),
    }
}

fn member_allowed(
    event: &Event,
    create: &Event,
    auth: &impl AuthProvider,
) -> Result<(), AuthError> {
    let target = event
        .state_key()
        .ok_or(AuthError::MalformedMembership("missing state_key"))?;
    let new_membership = event
        .membership()
        .ok_or(AuthError::MalformedMembership("missing membership"))?;

    let current = auth
        .member(target)
        .and_then(Event::membership)
        .map(str::to_string);
    let levels = PowerLevels::from(auth, create);

    match new_membership {
        "join" => {
            if event.sender() != target {
                return Err(AuthError::MalformedMembership(
                    "join must be sent by the joining user",
                ));
            }
            if current.as_deref() == Some("ban") {
                return Err(AuthError::MembershipTransition {
                    from: current,
                    to: "join".into(),
                });
            }
            // The room creator's initial join needs no invite.
            if create.sender() == target && current.is_none() {
                return Ok(());
            }
            match join_rule(auth) {
                JoinRule::Public => Ok(()),
                JoinRule::Invite => match current.as_deref() {
                    Some("invite") | Some("join") => Ok(()),
                    _ => Err(AuthError::JoinRulesForbid("invite".into())),
                },
                JoinRule::Other(rule) => Err(AuthError::JoinRulesForbid(rule)),
            }
        }
        "invite" => {
            if let Some(token) = third_party_invite_token(event.content()) {
                return match auth.third_party_invite(token) {
                    Some(_) => Ok(()),
                    None => Err(AuthError::UnknownThirdPartyInvite(token.to_string())),
                };
            }
            require_joined(event.sender(), auth)?;
            match current.as_deref() {
                Some("join") | Some("ban") => Err(AuthError::MembershipTransition {
                    from: current.clone(),
                    to: "invite".into(),
                }),
                _ => {
                    let have = levels.user_level(event.sender());
                    if have < levels.invite {
                        return Err(AuthError::InsufficientPowerLevel {
                            needed: levels.invite,
                            have,
                        });
                    }
                    Ok(())
                }
            }
        }
        "leave" => {
            if event.sender() == target {
                // Leaving (or rejecting an invite) is always the user's right.
                match current.as_deref() {
                    Some("join") | Some("invite") => Ok(()),
                    _ => Err(AuthError::MembershipTransition {
                        from: current.clone(),
                        to: "leave".into(),
                    }),
                }
            } else {
                // A kick: the sender needs the kick level and must outrank
                // the target.
                require_joined(event.sender(), auth)?;
                let have = levels.user_level(event.sender());
                if have < levels.kick {
                    return Err(AuthError::InsufficientPowerLevel {
                        needed: levels.kick,
                        have,
                    });
                }
                if have <= levels.user_level(target) {
                    return Err(AuthError::InsufficientPowerLevel {
                        needed: levels.user_level(target) + 1,
                        have,
                    });
                }
                Ok(())
            }
        }
        "ban" => {
            require_joined(event.sender(), auth)?;
            let have = levels.user_level(event.sender());
            if have < levels.ban {
                return Err(AuthError::InsufficientPowerLevel {
                    needed: levels.ban,
                    have,
                });
            }
            if have <= levels.user_level(target) {
                return Err(AuthError::InsufficientPowerLevel {
                    needed: levels.user_level(target) + 1,
                    have,
                });
            }
            Ok(())
        }
        other => Err(AuthError::MembershipTransition {
            from: current,
            to: other.to_string(),
        }),
    }
}

fn third_party_invite_token(content: &Value) -> Option<&str> {
    content
        .get("third_party_invite")?
        .get("signed")?
        .get("token")?
        .as_str()
}

enum JoinRule {
    Public,
    Invite,
    Other(String),
}

fn join_rule(auth: &impl AuthProvider) -> JoinRule {
    let rule = auth
        .join_rules()
        .and_then(|e| e.content().get("join_rule"))
        .and_then(Value::as_str);
    match rule {
        Some("public") => JoinRule::Public,
        // A room without join rules admits nobody who wasn't invited.
        Some("invite") | None => JoinRule::Invite,
        Some(other) => JoinRule::Other(other.to_string()),
    }
}

/// The power-level table, with defaults applied.
struct PowerLevels<'a> {
    content: Option<&'a Value>,
    creator: &'a str,
    users_default: i64,
    events_default: i64,
    state_default: i64,
    invite: i64,
    kick: i64,
    ban: i64,
}

impl<'a> PowerLevels<'a> {
    fn from(auth: &'a impl AuthProvider, create: &'a Event) -> Self {
        let content = auth.power_levels().map(Event::content);
        let get = |key: &str, default: i64| {
            content
                .and_then(|c| c.get(key))
                .and_then(Value::as_i64)
                .unwrap_or(default)
        };
        Self {
            content,
            creator: create.sender(),
            users_default: get("users_default", 0),
            // Without a power-level event nothing is privileged.
            events_default: get("events_default", 0),
            state_default: if content.is_some() {
                get("state_default", 50)
            } else {
                0
            },
            invite: get("invite", 0),
            kick: get("kick", 50),
            ban: get("ban", 50),
        }
    }

    fn user_level(&self, user: &str) -> i64 {
        if let Some(level) = self
            .content
            .and_then(|c| c.get("users"))
            .and_then(|u| u.get(user))
            .and_then(Value::as_i64)
        {
            return level;
        }
        // The creator holds the conventional top level until a power-level
        // event says otherwise.
        if self.content.is_none() && user == self.creator {
            return 100;
        }
        self.users_default
    }

    fn required_for(&self, event: &Event) -> i64 {
        if let Some(level) = self
            .content
            .and_then(|c| c.get("events"))
            .and_then(|e| e.get(event.event_type()))
            .and_then(Value::as_i64)
        {
            return level;
        }
        if event.is_state() {
            self.state_default
        } else {
            self.events_default
        }
    }
}
