// Remapd Remap Engine
// Per-session translation with balanced press/release bookkeeping

use std::sync::Arc;

use evdev::{EventType, InputEvent, Key};
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::mapping::MappingTable;

/// EV_SYN SYN_REPORT code
const SYN_REPORT: u16 = 0;

const KEY_RELEASE: i32 = 0;
const KEY_PRESS: i32 = 1;
const KEY_REPEAT: i32 = 2;

/// Synthetic events produced for one incoming physical event, in emit order
pub type Emission = SmallVec<[InputEvent; 4]>;

/// Stateful translator for one device session.
///
/// Tracks the output codes currently held down as a result of translation
/// so that every synthetic press is matched by exactly one release, and
/// releases unwind in the exact reverse of press order. One engine instance
/// per session; state is never shared across devices.
pub struct RemapEngine {
    table: Arc<MappingTable>,
    group: usize,
    /// Source code -> flattened output codes held down, in press order.
    /// An entry exists iff the physical key is currently down.
    held: IndexMap<u16, SmallVec<[Key; 4]>>,
}

impl RemapEngine {
    /// Create an engine bound to one device group of the shared table
    pub fn new(table: Arc<MappingTable>, group: usize) -> Self {
        Self {
            table,
            group,
            held: IndexMap::new(),
        }
    }

    /// Number of source codes currently held down through a mapping
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Translate one physical event into the synthetic events to emit.
    ///
    /// Mapped key events become their translated sequence followed by a
    /// SYN marker; everything else is forwarded verbatim. Incoming EV_SYN
    /// is dropped because the engine emits its own markers.
    pub fn translate(&mut self, event: InputEvent) -> Emission {
        if event.event_type() == EventType::SYNCHRONIZATION {
            return Emission::new();
        }
        if event.event_type() != EventType::KEY {
            return forward(event);
        }

        match event.value() {
            KEY_PRESS => self.press(event),
            KEY_RELEASE => self.release(event),
            KEY_REPEAT => self.repeat(event),
            _ => forward(event),
        }
    }

    /// Release every output code still held, unwinding in exact reverse of
    /// press order. Used at session teardown so no synthetic key is left
    /// stuck on the virtual device.
    pub fn release_held(&mut self) -> Emission {
        if self.held.is_empty() {
            return Emission::new();
        }

        let mut out = Emission::new();
        let entries: Vec<SmallVec<[Key; 4]>> = self.held.drain(..).map(|(_, v)| v).collect();
        for codes in entries.iter().rev() {
            for key in codes.iter().rev() {
                out.push(key_event(*key, KEY_RELEASE));
            }
        }
        out.push(syn());
        out
    }

    fn press(&mut self, event: InputEvent) -> Emission {
        let code = event.code();
        let Some(actions) = self.table.lookup(self.group, code) else {
            return forward(event);
        };
        if self.held.contains_key(&code) {
            // Duplicate press while already down. Emitting the chord again
            // would leave the first set of presses unbalanced, so drop it.
            log::warn!("duplicate press for mapped code {code}, dropping");
            return Emission::new();
        }

        let mut pressed: SmallVec<[Key; 4]> = SmallVec::new();
        let mut out = Emission::new();
        for action in actions {
            for key in action.codes() {
                out.push(key_event(*key, KEY_PRESS));
                pressed.push(*key);
            }
        }
        out.push(syn());
        self.held.insert(code, pressed);
        out
    }

    fn release(&mut self, event: InputEvent) -> Emission {
        let code = event.code();
        if let Some(pressed) = self.held.shift_remove(&code) {
            let mut out = Emission::new();
            for key in pressed.iter().rev() {
                out.push(key_event(*key, KEY_RELEASE));
            }
            out.push(syn());
            return out;
        }

        if self.table.lookup(self.group, code).is_some() {
            // Mapped code released with no tracked press, e.g. the key was
            // already down when the session started. Forward verbatim.
            log::warn!("unbalanced release for mapped code {code}, forwarding verbatim");
        }
        forward(event)
    }

    fn repeat(&mut self, event: InputEvent) -> Emission {
        let code = event.code();
        if let Some(pressed) = self.held.get(&code) {
            // Repeat policy: re-emit on the last output code only. The last
            // code of a chord is the payload, the rest are modifiers.
            let last = pressed[pressed.len() - 1];
            let mut out = Emission::new();
            out.push(key_event(last, KEY_REPEAT));
            out.push(syn());
            return out;
        }
        forward(event)
    }
}

fn key_event(key: Key, value: i32) -> InputEvent {
    InputEvent::new(EventType::KEY, key.code(), value)
}

fn syn() -> InputEvent {
    InputEvent::new(EventType::SYNCHRONIZATION, SYN_REPORT, 0)
}

/// Forward a physical event verbatim, followed by a SYN marker
fn forward(event: InputEvent) -> Emission {
    let mut out = Emission::new();
    out.push(InputEvent::new(
        event.event_type(),
        event.code(),
        event.value(),
    ));
    out.push(syn());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{DeviceGroup, DeviceSelector, OutputAction, RemapRule};

    fn table() -> Arc<MappingTable> {
        let rules = vec![
            RemapRule::new(Key::BTN_EXTRA, vec![OutputAction::Single(Key::KEY_Z)]),
            RemapRule::new(
                Key::BTN_SIDE,
                vec![OutputAction::Chord(vec![Key::KEY_LEFTMETA, Key::KEY_A])],
            ),
            RemapRule::new(
                Key::KEY_F13,
                vec![
                    OutputAction::Single(Key::KEY_B),
                    OutputAction::Chord(vec![Key::KEY_LEFTCTRL, Key::KEY_C]),
                ],
            ),
        ];
        let selector = DeviceSelector {
            input_name: Some("Test".to_string()),
            ..Default::default()
        };
        Arc::new(MappingTable::new(vec![DeviceGroup::new(
            selector, "remapd Test", rules,
        )]))
    }

    fn engine() -> RemapEngine {
        RemapEngine::new(table(), 0)
    }

    fn key(code: Key, value: i32) -> InputEvent {
        InputEvent::new(EventType::KEY, code.code(), value)
    }

    fn trace(events: &[InputEvent]) -> Vec<(EventType, u16, i32)> {
        events
            .iter()
            .map(|e| (e.event_type(), e.code(), e.value()))
            .collect()
    }

    const EV_KEY: EventType = EventType::KEY;
    const EV_SYN: EventType = EventType::SYNCHRONIZATION;
    const EV_REL: EventType = EventType::RELATIVE;

    #[test]
    fn test_chord_press_then_reverse_release() {
        let mut engine = engine();

        let press = engine.translate(key(Key::BTN_SIDE, KEY_PRESS));
        assert_eq!(
            trace(&press),
            vec![
                (EV_KEY, Key::KEY_LEFTMETA.code(), KEY_PRESS),
                (EV_KEY, Key::KEY_A.code(), KEY_PRESS),
                (EV_SYN, 0, 0),
            ]
        );

        let release = engine.translate(key(Key::BTN_SIDE, KEY_RELEASE));
        assert_eq!(
            trace(&release),
            vec![
                (EV_KEY, Key::KEY_A.code(), KEY_RELEASE),
                (EV_KEY, Key::KEY_LEFTMETA.code(), KEY_RELEASE),
                (EV_SYN, 0, 0),
            ]
        );
        assert_eq!(engine.held_count(), 0);
    }

    #[test]
    fn test_presses_and_releases_balance() {
        let mut engine = engine();
        let sources = [Key::BTN_EXTRA, Key::BTN_SIDE, Key::KEY_F13];

        let mut presses = 0usize;
        let mut releases = 0usize;
        for source in sources {
            for e in engine.translate(key(source, KEY_PRESS)) {
                if e.event_type() == EV_KEY && e.value() == KEY_PRESS {
                    presses += 1;
                }
            }
        }
        for source in sources.iter().rev() {
            for e in engine.translate(key(*source, KEY_RELEASE)) {
                if e.event_type() == EV_KEY && e.value() == KEY_RELEASE {
                    releases += 1;
                }
            }
        }

        assert_eq!(presses, releases);
        assert_eq!(engine.held_count(), 0);
    }

    #[test]
    fn test_multi_action_rule_flattens_and_unwinds() {
        let mut engine = engine();

        let press = engine.translate(key(Key::KEY_F13, KEY_PRESS));
        assert_eq!(
            trace(&press),
            vec![
                (EV_KEY, Key::KEY_B.code(), KEY_PRESS),
                (EV_KEY, Key::KEY_LEFTCTRL.code(), KEY_PRESS),
                (EV_KEY, Key::KEY_C.code(), KEY_PRESS),
                (EV_SYN, 0, 0),
            ]
        );

        let release = engine.translate(key(Key::KEY_F13, KEY_RELEASE));
        assert_eq!(
            trace(&release),
            vec![
                (EV_KEY, Key::KEY_C.code(), KEY_RELEASE),
                (EV_KEY, Key::KEY_LEFTCTRL.code(), KEY_RELEASE),
                (EV_KEY, Key::KEY_B.code(), KEY_RELEASE),
                (EV_SYN, 0, 0),
            ]
        );
    }

    #[test]
    fn test_unmapped_key_forwarded_verbatim() {
        let mut engine = engine();

        let out = engine.translate(key(Key::KEY_Q, KEY_PRESS));
        assert_eq!(
            trace(&out),
            vec![(EV_KEY, Key::KEY_Q.code(), KEY_PRESS), (EV_SYN, 0, 0)]
        );
        assert_eq!(engine.held_count(), 0);
    }

    #[test]
    fn test_non_key_events_forwarded_verbatim() {
        let mut engine = engine();

        // REL_X motion on a mouse whose buttons are remapped
        let motion = InputEvent::new(EventType::RELATIVE, 0, -3);
        let out = engine.translate(motion);
        assert_eq!(trace(&out), vec![(EV_REL, 0, -3), (EV_SYN, 0, 0)]);
    }

    #[test]
    fn test_incoming_syn_dropped() {
        let mut engine = engine();

        let out = engine.translate(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
        assert!(out.is_empty());
    }

    #[test]
    fn test_relative_ordering_preserved_with_mapped_events() {
        let mut engine = engine();
        let mut emitted = Vec::new();

        emitted.extend(engine.translate(key(Key::BTN_EXTRA, KEY_PRESS)));
        emitted.extend(engine.translate(InputEvent::new(EventType::RELATIVE, 0, 5)));
        emitted.extend(engine.translate(key(Key::BTN_EXTRA, KEY_RELEASE)));

        assert_eq!(
            trace(&emitted),
            vec![
                (EV_KEY, Key::KEY_Z.code(), KEY_PRESS),
                (EV_SYN, 0, 0),
                (EV_REL, 0, 5),
                (EV_SYN, 0, 0),
                (EV_KEY, Key::KEY_Z.code(), KEY_RELEASE),
                (EV_SYN, 0, 0),
            ]
        );
    }

    #[test]
    fn test_anomalous_release_forwarded_not_panic() {
        let mut engine = engine();

        // Release of a mapped code with no tracked press
        let out = engine.translate(key(Key::BTN_SIDE, KEY_RELEASE));
        assert_eq!(
            trace(&out),
            vec![(EV_KEY, Key::BTN_SIDE.code(), KEY_RELEASE), (EV_SYN, 0, 0)]
        );
        assert_eq!(engine.held_count(), 0);
    }

    #[test]
    fn test_duplicate_press_dropped_keeps_balance() {
        let mut engine = engine();

        engine.translate(key(Key::BTN_SIDE, KEY_PRESS));
        let dup = engine.translate(key(Key::BTN_SIDE, KEY_PRESS));
        assert!(dup.is_empty());
        assert_eq!(engine.held_count(), 1);

        let release = engine.translate(key(Key::BTN_SIDE, KEY_RELEASE));
        assert_eq!(
            trace(&release),
            vec![
                (EV_KEY, Key::KEY_A.code(), KEY_RELEASE),
                (EV_KEY, Key::KEY_LEFTMETA.code(), KEY_RELEASE),
                (EV_SYN, 0, 0),
            ]
        );
        assert_eq!(engine.held_count(), 0);

        // After the one release the session is fully unwound
        assert!(engine.release_held().is_empty());
    }

    #[test]
    fn test_repeat_reemits_last_output_code() {
        let mut engine = engine();

        engine.translate(key(Key::BTN_SIDE, KEY_PRESS));
        let out = engine.translate(key(Key::BTN_SIDE, KEY_REPEAT));
        assert_eq!(
            trace(&out),
            vec![(EV_KEY, Key::KEY_A.code(), KEY_REPEAT), (EV_SYN, 0, 0)]
        );
    }

    #[test]
    fn test_repeat_of_unmapped_key_passes_through() {
        let mut engine = engine();

        let out = engine.translate(key(Key::KEY_Q, KEY_REPEAT));
        assert_eq!(
            trace(&out),
            vec![(EV_KEY, Key::KEY_Q.code(), KEY_REPEAT), (EV_SYN, 0, 0)]
        );
    }

    #[test]
    fn test_release_held_unwinds_in_reverse_press_order() {
        let mut engine = engine();

        engine.translate(key(Key::BTN_EXTRA, KEY_PRESS));
        engine.translate(key(Key::BTN_SIDE, KEY_PRESS));

        let out = engine.release_held();
        assert_eq!(
            trace(&out),
            vec![
                (EV_KEY, Key::KEY_A.code(), KEY_RELEASE),
                (EV_KEY, Key::KEY_LEFTMETA.code(), KEY_RELEASE),
                (EV_KEY, Key::KEY_Z.code(), KEY_RELEASE),
                (EV_SYN, 0, 0),
            ]
        );
        assert_eq!(engine.held_count(), 0);
        assert!(engine.release_held().is_empty());
    }

    #[test]
    fn test_identical_traces_across_independent_engines() {
        let script = [
            key(Key::BTN_SIDE, KEY_PRESS),
            InputEvent::new(EventType::RELATIVE, 1, 2),
            key(Key::BTN_SIDE, KEY_REPEAT),
            key(Key::KEY_Q, KEY_PRESS),
            key(Key::KEY_Q, KEY_RELEASE),
            key(Key::BTN_SIDE, KEY_RELEASE),
        ];

        let run = |mut engine: RemapEngine| -> Vec<(EventType, u16, i32)> {
            let mut out = Vec::new();
            for event in script.iter().cloned() {
                out.extend(engine.translate(event));
            }
            trace(&out)
        };

        assert_eq!(run(engine()), run(engine()));
    }
}
