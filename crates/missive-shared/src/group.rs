//! Private group chats as a signed, clock-ordered log of membership events.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{verify_signature, Identity};
use crate::types::PublicKey;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MembershipEventKind {
    ChatCreated { name: String },
    NameChanged { name: String },
    MembersAdded { members: Vec<PublicKey> },
    MemberJoined { member: PublicKey },
    AdminsAdded { admins: Vec<PublicKey> },
    MemberRemoved { member: PublicKey },
    AdminRemoved { admin: PublicKey },
}

/// One membership change, signed by its author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipUpdateEvent {
    pub clock: i64,
    pub kind: MembershipEventKind,
    pub from: PublicKey,
    pub signature: Vec<u8>,
}

fn event_digest(chat_id: &str, clock: i64, kind: &MembershipEventKind) -> Result<[u8; 32], ProtocolError> {
    let body = bincode::serialize(&(clock, kind))
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(chat_id.as_bytes());
    hasher.update(&body);
    Ok(*hasher.finalize().as_bytes())
}

impl MembershipUpdateEvent {
    pub fn new_signed(
        chat_id: &str,
        clock: i64,
        kind: MembershipEventKind,
        author: &Identity,
    ) -> Result<Self, ProtocolError> {
        let signature = author.sign(&event_digest(chat_id, clock, &kind)?);
        Ok(Self {
            clock,
            kind,
            from: author.public_key(),
            signature: signature.to_bytes().to_vec(),
        })
    }

    pub fn verify(&self, chat_id: &str) -> Result<(), ProtocolError> {
        verify_signature(
            &self.from,
            &event_digest(chat_id, self.clock, &self.kind)?,
            &self.signature,
        )
        .map_err(|_| ProtocolError::BadSignature)
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    chat_id: String,
    name: String,
    members: BTreeSet<PublicKey>,
    admins: BTreeSet<PublicKey>,
    events: Vec<MembershipUpdateEvent>,
}

impl Group {
    /// Start a new group with `creator` as its only member and admin.
    pub fn create(name: &str, creator: &Identity, clock: i64) -> Result<Self, ProtocolError> {
        let chat_id = format!("{}-{}", uuid::Uuid::new_v4(), creator.public_key().to_hex());
        let created = MembershipUpdateEvent::new_signed(
            &chat_id,
            clock,
            MembershipEventKind::ChatCreated { name: name.to_string() },
            creator,
        )?;
        Self::from_events(&chat_id, vec![created])
    }

    /// Rebuild a group by replaying `events` in clock order. Every event must
    /// carry a valid signature and be permitted at the point it applies.
    pub fn from_events(
        chat_id: &str,
        mut events: Vec<MembershipUpdateEvent>,
    ) -> Result<Self, ProtocolError> {
        events.sort_by_key(|e| e.clock);

        let mut group = Group {
            chat_id: chat_id.to_string(),
            name: String::new(),
            members: BTreeSet::new(),
            admins: BTreeSet::new(),
            events: Vec::with_capacity(events.len()),
        };

        for event in events {
            event.verify(chat_id)?;
            group.apply(event)?;
        }

        let creator = group.creator()?;
        if !chat_id.ends_with(&creator.to_hex()) || chat_id == creator.to_hex() {
            return Err(ProtocolError::InvalidMembershipEvent(format!(
                "chat id {chat_id} not owned by its creator"
            )));
        }
        Ok(group)
    }

    /// Sign `kind` as `author` at the next clock value and apply it.
    pub fn process(
        &mut self,
        author: &Identity,
        kind: MembershipEventKind,
    ) -> Result<&MembershipUpdateEvent, ProtocolError> {
        let event =
            MembershipUpdateEvent::new_signed(&self.chat_id, self.next_clock(), kind, author)?;
        self.apply(event)?;
        self.events
            .last()
            .ok_or_else(|| ProtocolError::InvalidMembershipEvent("event not recorded".into()))
    }

    fn apply(&mut self, event: MembershipUpdateEvent) -> Result<(), ProtocolError> {
        if !self.is_valid(&event) {
            return Err(ProtocolError::InvalidMembershipEvent(format!(
                "{:?} from {}",
                event.kind,
                event.from.short()
            )));
        }

        match &event.kind {
            MembershipEventKind::ChatCreated { name } => {
                self.name = name.clone();
                self.members.insert(event.from);
                self.admins.insert(event.from);
            }
            MembershipEventKind::NameChanged { name } => self.name = name.clone(),
            MembershipEventKind::MembersAdded { members } => self.members.extend(members),
            MembershipEventKind::MemberJoined { member } => {
                self.members.insert(*member);
            }
            MembershipEventKind::AdminsAdded { admins } => self.admins.extend(admins),
            MembershipEventKind::MemberRemoved { member } => {
                self.members.remove(member);
            }
            MembershipEventKind::AdminRemoved { admin } => {
                self.admins.remove(admin);
            }
        }
        self.events.push(event);
        Ok(())
    }

    fn is_valid(&self, event: &MembershipUpdateEvent) -> bool {
        let from = &event.from;
        match &event.kind {
            MembershipEventKind::ChatCreated { .. } => {
                self.admins.is_empty() && self.members.is_empty()
            }
            MembershipEventKind::NameChanged { name } => {
                self.admins.contains(from) && !name.is_empty()
            }
            MembershipEventKind::MembersAdded { .. } => self.admins.contains(from),
            MembershipEventKind::MemberJoined { member } => {
                self.members.contains(from) && from == member
            }
            MembershipEventKind::MemberRemoved { member } => {
                from == member || (self.admins.contains(from) && !self.admins.contains(member))
            }
            MembershipEventKind::AdminsAdded { admins } => {
                self.admins.contains(from) && admins.iter().all(|a| self.members.contains(a))
            }
            MembershipEventKind::AdminRemoved { admin } => {
                self.admins.contains(from) && from == admin
            }
        }
    }

    fn creator(&self) -> Result<PublicKey, ProtocolError> {
        match self.events.first() {
            Some(MembershipUpdateEvent {
                kind: MembershipEventKind::ChatCreated { .. },
                from,
                ..
            }) => Ok(*from),
            _ => Err(ProtocolError::InvalidMembershipEvent(
                "first event must create the chat".into(),
            )),
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &BTreeSet<PublicKey> {
        &self.members
    }

    pub fn admins(&self) -> &BTreeSet<PublicKey> {
        &self.admins
    }

    pub fn events(&self) -> &[MembershipUpdateEvent] {
        &self.events
    }

    pub fn joined(&self) -> Vec<PublicKey> {
        self.events
            .iter()
            .filter_map(|e| match e.kind {
                MembershipEventKind::MemberJoined { member } => Some(member),
                _ => None,
            })
            .collect()
    }

    pub fn last_clock(&self) -> i64 {
        self.events.last().map(|e| e.clock).unwrap_or(0)
    }

    pub fn next_clock(&self) -> i64 {
        self.last_clock() + 1
    }

    /// The smallest event subset that still rebuilds the current state:
    /// creation, the latest rename, the latest addition and join of each
    /// current member, admin grants still in force, and the removals needed
    /// to undo anyone re-introduced by a kept addition.
    pub fn abridged_events(&self) -> Vec<MembershipUpdateEvent> {
        let mut kept: Vec<&MembershipUpdateEvent> = Vec::new();
        let mut name_found = false;
        let mut added: HashSet<PublicKey> = HashSet::new();
        let mut joined: HashSet<PublicKey> = HashSet::new();
        let mut granted: HashSet<PublicKey> = HashSet::new();

        for event in self.events.iter().rev() {
            let keep = match &event.kind {
                MembershipEventKind::ChatCreated { .. } => true,
                MembershipEventKind::NameChanged { .. } => !std::mem::replace(&mut name_found, true),
                MembershipEventKind::MembersAdded { members } => {
                    let mut keep = false;
                    for m in members {
                        if self.members.contains(m) && added.insert(*m) {
                            keep = true;
                        }
                    }
                    keep
                }
                MembershipEventKind::MemberJoined { member } => {
                    self.members.contains(member) && joined.insert(*member)
                }
                MembershipEventKind::AdminsAdded { admins } => {
                    let mut keep = false;
                    for a in admins {
                        if self.admins.contains(a) && granted.insert(*a) {
                            keep = true;
                        }
                    }
                    keep
                }
                MembershipEventKind::MemberRemoved { .. }
                | MembershipEventKind::AdminRemoved { .. } => false,
            };
            if keep {
                kept.push(event);
            }
        }

        // Additions and grants are all-or-nothing, so they may bring back
        // people who have since left. Keep the latest removal after each.
        let mut reintroduced: HashMap<PublicKey, i64> = HashMap::new();
        let mut regranted: HashMap<PublicKey, i64> = HashMap::new();
        for event in &kept {
            match &event.kind {
                MembershipEventKind::MembersAdded { members } => {
                    for m in members.iter().filter(|m| !self.members.contains(*m)) {
                        let clock = reintroduced.entry(*m).or_insert(event.clock);
                        *clock = (*clock).max(event.clock);
                    }
                }
                MembershipEventKind::AdminsAdded { admins } => {
                    for a in admins.iter().filter(|a| !self.admins.contains(*a)) {
                        let clock = regranted.entry(*a).or_insert(event.clock);
                        *clock = (*clock).max(event.clock);
                    }
                }
                _ => {}
            }
        }

        let mut removals: HashMap<(PublicKey, bool), &MembershipUpdateEvent> = HashMap::new();
        for event in &self.events {
            let (key, after) = match &event.kind {
                MembershipEventKind::MemberRemoved { member } => {
                    ((*member, false), reintroduced.get(member))
                }
                MembershipEventKind::AdminRemoved { admin } => ((*admin, true), regranted.get(admin)),
                _ => continue,
            };
            if matches!(after, Some(clock) if event.clock > *clock) {
                removals.insert(key, event);
            }
        }
        kept.extend(removals.into_values());

        let mut out: Vec<MembershipUpdateEvent> = kept.into_iter().cloned().collect();
        out.sort_by_key(|e| e.clock);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_group() {
        let creator = Identity::generate();
        let group = Group::create("friends", &creator, 1).unwrap();

        assert_eq!(group.name(), "friends");
        assert!(group.members().contains(&creator.public_key()));
        assert!(group.admins().contains(&creator.public_key()));
        assert!(group.chat_id().ends_with(&creator.public_key().to_hex()));
    }

    #[test]
    fn test_non_admin_cannot_add_members() {
        let creator = Identity::generate();
        let outsider = Identity::generate();
        let mut group = Group::create("g", &creator, 1).unwrap();

        let result = group.process(
            &outsider,
            MembershipEventKind::MembersAdded { members: vec![outsider.public_key()] },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_member_can_leave() {
        let creator = Identity::generate();
        let alice = Identity::generate();
        let mut group = Group::create("g", &creator, 1).unwrap();

        group
            .process(&creator, MembershipEventKind::MembersAdded { members: vec![alice.public_key()] })
            .unwrap();
        group
            .process(&alice, MembershipEventKind::MemberJoined { member: alice.public_key() })
            .unwrap();
        group
            .process(&alice, MembershipEventKind::MemberRemoved { member: alice.public_key() })
            .unwrap();

        assert!(!group.members().contains(&alice.public_key()));
        assert_eq!(group.joined(), vec![alice.public_key()]);
    }

    #[test]
    fn test_replay_rejects_forged_event() {
        let creator = Identity::generate();
        let mut group = Group::create("g", &creator, 1).unwrap();
        group
            .process(&creator, MembershipEventKind::NameChanged { name: "renamed".into() })
            .unwrap();

        let mut events = group.events().to_vec();
        events[1].kind = MembershipEventKind::NameChanged { name: "forged".into() };
        assert!(matches!(
            Group::from_events(group.chat_id(), events),
            Err(ProtocolError::BadSignature)
        ));
    }

    #[test]
    fn test_abridged_events_rebuild_current_state() {
        let creator = Identity::generate();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut group = Group::create("g", &creator, 1).unwrap();

        group
            .process(
                &creator,
                MembershipEventKind::MembersAdded {
                    members: vec![alice.public_key(), bob.public_key()],
                },
            )
            .unwrap();
        group
            .process(&creator, MembershipEventKind::MemberRemoved { member: bob.public_key() })
            .unwrap();
        group
            .process(&creator, MembershipEventKind::NameChanged { name: "first".into() })
            .unwrap();
        group
            .process(&creator, MembershipEventKind::NameChanged { name: "second".into() })
            .unwrap();

        let abridged = group.abridged_events();
        assert_eq!(abridged.len(), 4);
        assert!(!abridged.iter().any(
            |e| matches!(&e.kind, MembershipEventKind::NameChanged { name } if name == "first")
        ));

        let rebuilt = Group::from_events(group.chat_id(), abridged).unwrap();
        assert_eq!(rebuilt.members(), group.members());
        assert_eq!(rebuilt.admins(), group.admins());
        assert_eq!(rebuilt.name(), "second");
    }
}
