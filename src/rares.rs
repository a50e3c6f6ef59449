//! Probabilistic "rare" decoration for outbound emotes.

use crate::proto::EventDataOut;
use rand::Rng;

/// With probability `chance`, append the `"rare"` modifier to every emote
/// in the outbound payload. Independent coin flip per message; no state.
pub fn transform_rares(msg: &mut EventDataOut, chance: f64) {
    if rand::thread_rng().gen::<f64>() > chance {
        return;
    }
    if let Some(entities) = msg.entities.as_mut() {
        for emote in &mut entities.emotes {
            emote.modifiers.push("rare".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Emote, Entities};
    use crate::user::{FeatureMemo, User, Userid};

    fn emote_msg() -> EventDataOut {
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
        EventDataOut::message(user.simplified(), "LUL".into(), entities)
    }

    #[test]
    fn certain_chance_always_decorates() {
        let mut msg = emote_msg();
        transform_rares(&mut msg, 1.0);
        assert_eq!(
            msg.entities.unwrap().emotes[0].modifiers,
            vec!["rare".to_string()]
        );
    }

    #[test]
    fn zero_chance_never_decorates() {
        for _ in 0..100 {
            let mut msg = emote_msg();
            transform_rares(&mut msg, 0.0);
            assert!(msg.entities.unwrap().emotes[0].modifiers.is_empty());
        }
    }
}
