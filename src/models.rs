//! Channel and bridge rows held by the state store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ari::{AriBridge, AriChannel, ChannelState, HangupCause};

/// Channel variable setting `Channel::direction`.
pub const VAR_DIRECTION: &str = "VB-DIRECTION";
/// Channel variable setting `Channel::sip_call_id`.
pub const VAR_SIP_CALLID: &str = "VB-SIP_CALLID";
/// Channel variable setting `Channel::sip_transport`.
pub const VAR_SIP_TRANSPORT: &str = "VB-SIP_TRANSPORT";

/// One call leg on a switch.
///
/// `bridge_id` is set exactly while the channel is a member of that bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    /// Switch instance owning the channel.
    pub peer_id: String,
    pub name: String,
    pub state: ChannelState,

    pub caller_name: String,
    pub caller_number: String,
    pub connected_name: String,
    pub connected_number: String,

    pub dialplan_context: String,
    pub dialplan_extension: String,

    pub bridge_id: Option<String>,

    pub stasis_application: String,
    pub stasis_args: BTreeMap<String, String>,
    /// Call-control owner selected at stasis start.
    pub owner: Option<String>,

    pub variables: BTreeMap<String, String>,
    pub direction: String,
    pub sip_call_id: String,
    pub sip_transport: String,

    pub hangup_cause: Option<HangupCause>,

    pub creation_time: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_ringing: Option<DateTime<Utc>>,
    pub tm_answer: Option<DateTime<Utc>>,
    pub tm_end: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn from_ari(peer_id: &str, ari: &AriChannel) -> Self {
        Self {
            id: ari.id.clone(),
            peer_id: peer_id.to_string(),
            name: ari.name.clone(),
            state: ari.state,
            caller_name: ari.caller.name.clone(),
            caller_number: ari.caller.number.clone(),
            connected_name: ari.connected.name.clone(),
            connected_number: ari.connected.number.clone(),
            dialplan_context: ari.dialplan.context.clone(),
            dialplan_extension: ari.dialplan.exten.clone(),
            creation_time: ari.creationtime,
            ..Default::default()
        }
    }

    /// Refresh the switch-reported fields, keeping local bookkeeping.
    pub fn refresh(&mut self, ari: &AriChannel) {
        self.name = ari.name.clone();
        self.state = ari.state;
        self.caller_name = ari.caller.name.clone();
        self.caller_number = ari.caller.number.clone();
        self.connected_name = ari.connected.name.clone();
        self.connected_number = ari.connected.number.clone();
        if !ari.dialplan.context.is_empty() {
            self.dialplan_context = ari.dialplan.context.clone();
            self.dialplan_extension = ari.dialplan.exten.clone();
        }
    }

    /// Store a channel variable, mapping the well-known ones onto typed fields.
    pub fn set_variable(&mut self, name: &str, value: &str) {
        match name {
            VAR_DIRECTION => self.direction = value.to_string(),
            VAR_SIP_CALLID => self.sip_call_id = value.to_string(),
            VAR_SIP_TRANSPORT => self.sip_transport = value.to_string(),
            _ => {}
        }
        self.variables.insert(name.to_string(), value.to_string());
    }

    pub fn is_ended(&self) -> bool {
        self.tm_end.is_some()
    }
}

/// Mixing point joining channels on a switch.
///
/// Every id in `channel_ids` names a channel whose `bridge_id` is this bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub id: String,
    pub peer_id: String,
    pub name: String,
    pub technology: String,
    pub bridge_type: String,
    pub creator: String,
    pub channel_ids: BTreeSet<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub tm_update: Option<DateTime<Utc>>,
}

impl Bridge {
    /// Bridge row from an event; membership starts empty and is driven by
    /// enter/leave events only.
    pub fn from_ari(peer_id: &str, ari: &AriBridge) -> Self {
        Self {
            id: ari.id.clone(),
            peer_id: peer_id.to_string(),
            name: ari.name.clone(),
            technology: ari.technology.clone(),
            bridge_type: ari.bridge_type.clone(),
            creator: ari.creator.clone(),
            channel_ids: BTreeSet::new(),
            creation_time: ari.creationtime,
            tm_update: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_variables_set_typed_fields() {
        let mut channel = Channel::default();
        channel.set_variable(VAR_DIRECTION, "incoming");
        channel.set_variable(VAR_SIP_CALLID, "abc@host");
        channel.set_variable("CUSTOM", "1");

        assert_eq!(channel.direction, "incoming");
        assert_eq!(channel.sip_call_id, "abc@host");
        assert_eq!(channel.variables.len(), 3);
    }

    #[test]
    fn test_from_ari_copies_identity() {
        let mut ari = AriChannel {
            id: "c1".to_string(),
            state: ChannelState::Ring,
            ..Default::default()
        };
        ari.caller.number = "1001".to_string();
        ari.dialplan.context = "in-voipbin".to_string();

        let channel = Channel::from_ari("pbx1", &ari);

        assert_eq!(channel.peer_id, "pbx1");
        assert_eq!(channel.caller_number, "1001");
        assert_eq!(channel.dialplan_context, "in-voipbin");
        assert!(channel.bridge_id.is_none());
    }

    #[test]
    fn test_bridge_membership_ignores_event_snapshot() {
        let ari = AriBridge {
            id: "b1".to_string(),
            channels: vec!["c1".to_string()],
            ..Default::default()
        };
        assert!(Bridge::from_ari("pbx1", &ari).channel_ids.is_empty());
    }
}
