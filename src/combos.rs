//! Emote combo tracking.
//!
//! A combo is a run of consecutive chat messages whose full payload is the
//! same single emote, contributed by distinct users. One global state
//! machine observes every outbound chat event in order.

use crate::proto::EventDataOut;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

/// The sender has already contributed to the running combo; the message
/// is broadcast without combo decoration.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("user has already participated in combo")]
pub struct ComboDuplicate;

#[derive(Debug)]
struct ComboVariant {
    signature: String,
    modifiers: Vec<String>,
    count: usize,
}

#[derive(Debug, Default)]
struct ComboState {
    emote: String,
    count: usize,
    /// Insertion-ordered; ties for the leading variant go to the earliest.
    variants: Vec<ComboVariant>,
    participants: HashSet<String>,
}

impl ComboState {
    fn reset(&mut self) {
        self.emote.clear();
        self.count = 0;
        self.variants.clear();
        self.participants.clear();
    }
}

#[derive(Debug, Default)]
pub struct Combos {
    state: Mutex<ComboState>,
}

impl Combos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one outbound chat event through the state machine, stamping
    /// the combo counter and leading-variant modifiers when a combo is
    /// running.
    pub fn transform(&self, msg: &mut EventDataOut) -> Result<(), ComboDuplicate> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if !is_emote_message(msg) {
            state.reset();
            return Ok(());
        }
        let Some(entities) = msg.entities.as_mut() else {
            state.reset();
            return Ok(());
        };
        let emote = &mut entities.emotes[0];

        // a different emote breaks the running combo
        if state.emote != emote.name {
            state.reset();
        }

        let nick = msg.user.as_ref().map(|u| u.nick.as_str()).unwrap_or_default();
        if state.participants.contains(nick) {
            return Err(ComboDuplicate);
        }

        state.emote = emote.name.clone();
        state.count += 1;
        state.participants.insert(nick.to_string());

        let signature = emote.modifiers.join(":");
        match state.variants.iter_mut().find(|v| v.signature == signature) {
            Some(variant) => variant.count += 1,
            None => state.variants.push(ComboVariant {
                signature,
                modifiers: emote.modifiers.clone(),
                count: 1,
            }),
        }

        // the first contributor alone is not a combo
        if state.count == 1 {
            return Ok(());
        }

        emote.combo = state.count;

        let mut leading: Option<&ComboVariant> = None;
        for variant in &state.variants {
            if leading.map_or(true, |top| variant.count > top.count) {
                leading = Some(variant);
            }
        }
        if let Some(top) = leading {
            emote.modifiers = top.modifiers.clone();
        }

        Ok(())
    }
}

/// A "pure" single-emote message: exactly one emote whose bounds span the
/// full message text.
fn is_emote_message(msg: &EventDataOut) -> bool {
    let Some(entities) = msg.entities.as_ref() else {
        return false;
    };
    if entities.emotes.len() != 1 {
        return false;
    }
    let bounds = entities.emotes[0].bounds;
    bounds[0] == 0 && bounds[1] == msg.data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Emote, Entities};
    use crate::user::{FeatureMemo, User, Userid};

    fn emote_msg(nick: &str, emote: &str, modifiers: &[&str]) -> EventDataOut {
        let memo = FeatureMemo::new();
        let user = User::new(Userid(nick.len() as i64), nick.to_string(), 0, &memo);
        let entities = Entities {
            emotes: vec![Emote {
                name: emote.to_string(),
                modifiers: modifiers.iter().map(|m| m.to_string()).collect(),
                bounds: [0, emote.len() + modifiers.iter().map(|m| m.len() + 1).sum::<usize>()],
                combo: 0,
            }],
            ..Default::default()
        };
        let data: String = std::iter::once(emote.to_string())
            .chain(modifiers.iter().map(|m| m.to_string()))
            .collect::<Vec<_>>()
            .join(":");
        EventDataOut::message(user.simplified(), data, entities)
    }

    fn text_msg(nick: &str, data: &str) -> EventDataOut {
        let memo = FeatureMemo::new();
        let user = User::new(Userid(1), nick.to_string(), 0, &memo);
        EventDataOut::message(user.simplified(), data.to_string(), Entities::default())
    }

    fn combo_of(msg: &EventDataOut) -> usize {
        msg.entities.as_ref().map_or(0, |e| e.emotes[0].combo)
    }

    #[test]
    fn combo_counts_distinct_users() {
        // S2: a, b, c send the same emote back-to-back
        let combos = Combos::new();

        let mut first = emote_msg("a", "LUL", &[]);
        assert!(combos.transform(&mut first).is_ok());
        assert_eq!(combo_of(&first), 0);

        let mut second = emote_msg("b", "LUL", &[]);
        assert!(combos.transform(&mut second).is_ok());
        assert_eq!(combo_of(&second), 2);

        let mut third = emote_msg("c", "LUL", &[]);
        assert!(combos.transform(&mut third).is_ok());
        assert_eq!(combo_of(&third), 3);
    }

    #[test]
    fn duplicate_participant_is_rejected_undecorated() {
        let combos = Combos::new();
        let mut a = emote_msg("a", "LUL", &[]);
        let mut b = emote_msg("b", "LUL", &[]);
        combos.transform(&mut a).expect("first");
        combos.transform(&mut b).expect("second");

        let mut again = emote_msg("a", "LUL", &[]);
        assert_eq!(combos.transform(&mut again), Err(ComboDuplicate));
        assert_eq!(combo_of(&again), 0);

        // the combo itself keeps running for new participants
        let mut c = emote_msg("c", "LUL", &[]);
        combos.transform(&mut c).expect("third");
        assert_eq!(combo_of(&c), 3);
    }

    #[test]
    fn non_emote_message_resets() {
        let combos = Combos::new();
        let mut a = emote_msg("a", "LUL", &[]);
        let mut b = emote_msg("b", "LUL", &[]);
        combos.transform(&mut a).expect("first");
        combos.transform(&mut b).expect("second");

        let mut breaker = text_msg("d", "hi");
        combos.transform(&mut breaker).expect("reset");

        // previous participants may start a fresh combo
        let mut fresh = emote_msg("a", "LUL", &[]);
        combos.transform(&mut fresh).expect("fresh start");
        assert_eq!(combo_of(&fresh), 0);
    }

    #[test]
    fn different_emote_resets_before_counting() {
        let combos = Combos::new();
        let mut a = emote_msg("a", "LUL", &[]);
        let mut b = emote_msg("b", "LUL", &[]);
        combos.transform(&mut a).expect("first");
        combos.transform(&mut b).expect("second");

        let mut other = emote_msg("c", "PepeLaugh", &[]);
        combos.transform(&mut other).expect("new emote");
        assert_eq!(combo_of(&other), 0);

        let mut next = emote_msg("d", "PepeLaugh", &[]);
        combos.transform(&mut next).expect("second of new combo");
        assert_eq!(combo_of(&next), 2);
    }

    #[test]
    fn leading_variant_ties_go_to_first_insertion() {
        let combos = Combos::new();
        let mut plain = emote_msg("a", "LUL", &[]);
        combos.transform(&mut plain).expect("plain first");

        let mut wide = emote_msg("b", "LUL", &["wide"]);
        combos.transform(&mut wide).expect("wide second");

        // plain and wide are tied 1-1; the first-inserted (plain) leads
        assert_eq!(combo_of(&wide), 2);
        assert!(wide.entities.unwrap().emotes[0].modifiers.is_empty());
    }

    #[test]
    fn leading_variant_tracks_majority() {
        let combos = Combos::new();
        let mut a = emote_msg("a", "LUL", &["wide"]);
        let mut b = emote_msg("b", "LUL", &["wide"]);
        let mut c = emote_msg("c", "LUL", &[]);
        combos.transform(&mut a).expect("a");
        combos.transform(&mut b).expect("b");
        combos.transform(&mut c).expect("c");
        assert_eq!(combo_of(&c), 3);
        assert_eq!(
            c.entities.unwrap().emotes[0].modifiers,
            vec!["wide".to_string()]
        );
    }

    #[test]
    fn partial_emote_message_is_not_pure() {
        let combos = Combos::new();
        let memo = FeatureMemo::new();
        let user = User::new(Userid(1), "a".into(), 0, &memo);
        let entities = Entities {
            emotes: vec![Emote {
                name: "LUL".into(),
                modifiers: vec![],
                bounds: [0, 3],
                combo: 0,
            }],
            ..Default::default()
        };
        let mut msg =
            EventDataOut::message(user.simplified(), "LUL what".into(), entities);
        combos.transform(&mut msg).expect("not pure, resets");
        assert_eq!(combo_of(&msg), 0);
    }
}
