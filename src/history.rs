use crate::protocol::ParsedMessage;
use std::collections::HashMap;

/// Hide repeated emissions of the same action across a history, keeping only
/// the chronologically last occurrence visible. Works in place; also stamps
/// every action with the id of the message carrying it.
///
/// Returns the number of actions hidden.
pub fn dedupe(messages: &mut [ParsedMessage]) -> usize {
    let mut positions: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
    for (mi, message) in messages.iter_mut().enumerate() {
        let msg_id = message.msg_id.clone();
        for (ai, action) in message.actions.iter_mut().enumerate() {
            action.msg_id = msg_id.clone();
            positions.entry(action.hash.clone()).or_default().push((mi, ai));
        }
    }

    let mut hidden = 0;
    for occurrences in positions.values() {
        let Some((&(last_m, last_a), earlier)) = occurrences.split_last() else {
            continue;
        };
        if earlier.is_empty() {
            continue;
        }
        for &(mi, ai) in earlier {
            messages[mi].actions[ai].hide = true;
            hidden += 1;
        }
        messages[last_m].actions[last_a].hide = false;
    }
    hidden
}
