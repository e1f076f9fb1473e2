//! Touch gesture composition.
//!
//! Declarative touch actions ([`GestureAction`]) are compiled into per-pointer
//! step queues of raw [`PointerEvent`]s and pauses, then dispatched through the
//! device bridge.
//!
//! # Multi-action scheduling
//!
//! Each group of a multi-action is one simulated finger with its own queue.
//! The scheduler is event-driven round-robin: it visits groups in turn,
//! dispatching one step from each group that is ready, and a pause makes its
//! group unready until the pause elapses. When no group is ready it sleeps
//! until the earliest one becomes ready. Order within a group is never
//! changed, and no group waits for another group to finish.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::bridge::{DeviceBridge, PointerEvent, PointerPhase};
use crate::element::{ElementCache, Rect};
use crate::error::DriverError;

/// Hold time of a `longPress` not followed by an explicit `wait`.
pub const DEFAULT_LONG_PRESS_MS: u64 = 1000;

/// Where an action lands.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A cached element, optionally offset from its top-left corner.
    Element {
        /// Element id.
        id: String,
        /// Pixel offset from the element's origin.
        offset: Option<(f64, f64)>,
    },
    /// Absolute screen coordinates.
    Point {
        /// X coordinate.
        x: f64,
        /// Y coordinate.
        y: f64,
    },
}

/// One declarative touch action.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "WireAction", into = "WireAction")]
pub enum GestureAction {
    /// Put a finger down.
    Press(Target),
    /// Put a finger down and hold.
    LongPress {
        /// Where to press.
        target: Target,
        /// Hold time in milliseconds.
        duration_ms: u64,
    },
    /// Move the finger, or position it if it is up.
    MoveTo(Target),
    /// Lift the finger.
    Release,
    /// Pause.
    Wait {
        /// Pause length in milliseconds.
        ms: u64,
    },
    /// Press and release.
    Tap(Target),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
enum WireKind {
    Press,
    LongPress,
    MoveTo,
    Release,
    Wait,
    Tap,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
struct WireOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
}

/// Wire form: `{"action": "press", "options": {"element": "...", "x": 1, "y": 2}}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct WireAction {
    action: WireKind,
    #[serde(default)]
    options: WireOptions,
}

impl WireOptions {
    fn target(&self, kind: &str) -> Result<Target, String> {
        match (&self.element, self.x, self.y) {
            (Some(id), Some(x), Some(y)) => Ok(Target::Element {
                id: id.clone(),
                offset: Some((x, y)),
            }),
            (Some(id), None, None) => Ok(Target::Element {
                id: id.clone(),
                offset: None,
            }),
            (None, Some(x), Some(y)) => Ok(Target::Point { x, y }),
            _ => Err(format!(
                "'{}' needs an element, x and y coordinates, or both",
                kind
            )),
        }
    }

    fn from_target(target: Target) -> Self {
        match target {
            Target::Element { id, offset } => Self {
                element: Some(id),
                x: offset.map(|o| o.0),
                y: offset.map(|o| o.1),
                ..Default::default()
            },
            Target::Point { x, y } => Self {
                x: Some(x),
                y: Some(y),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireAction> for GestureAction {
    type Error = String;

    fn try_from(wire: WireAction) -> Result<Self, Self::Error> {
        let o = wire.options;
        Ok(match wire.action {
            WireKind::Press => GestureAction::Press(o.target("press")?),
            WireKind::LongPress => GestureAction::LongPress {
                target: o.target("longPress")?,
                duration_ms: o.duration.or(o.ms).unwrap_or(DEFAULT_LONG_PRESS_MS),
            },
            WireKind::MoveTo => GestureAction::MoveTo(o.target("moveTo")?),
            WireKind::Release => GestureAction::Release,
            WireKind::Wait => GestureAction::Wait {
                ms: o.ms.unwrap_or(0),
            },
            WireKind::Tap => GestureAction::Tap(o.target("tap")?),
        })
    }
}

impl From<GestureAction> for WireAction {
    fn from(action: GestureAction) -> Self {
        let (action, options) = match action {
            GestureAction::Press(t) => (WireKind::Press, WireOptions::from_target(t)),
            GestureAction::LongPress {
                target,
                duration_ms,
            } => (
                WireKind::LongPress,
                WireOptions {
                    duration: Some(duration_ms),
                    ..WireOptions::from_target(target)
                },
            ),
            GestureAction::MoveTo(t) => (WireKind::MoveTo, WireOptions::from_target(t)),
            GestureAction::Release => (WireKind::Release, WireOptions::default()),
            GestureAction::Wait { ms } => (
                WireKind::Wait,
                WireOptions {
                    ms: Some(ms),
                    ..Default::default()
                },
            ),
            GestureAction::Tap(t) => (WireKind::Tap, WireOptions::from_target(t)),
        };
        WireAction { action, options }
    }
}

/// One end of a drag: `{"options": {"element": "...", "x": 5, "y": 5}}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "WireDragPoint", into = "WireDragPoint")]
pub struct DragPoint(pub Target);

#[derive(Debug, Clone, Deserialize, Serialize)]
struct WireDragPoint {
    #[serde(default)]
    options: WireOptions,
}

impl TryFrom<WireDragPoint> for DragPoint {
    type Error = String;

    fn try_from(wire: WireDragPoint) -> Result<Self, Self::Error> {
        Ok(DragPoint(wire.options.target("drag")?))
    }
}

impl From<DragPoint> for WireDragPoint {
    fn from(point: DragPoint) -> Self {
        WireDragPoint {
            options: WireOptions::from_target(point.0),
        }
    }
}

/// Resolves element ids to on-screen rectangles.
pub trait ElementLocator: Send + Sync {
    /// Bounds of an element.
    fn element_rect(&self, id: &str) -> Result<Rect, DriverError>;
}

impl ElementLocator for ElementCache {
    fn element_rect(&self, id: &str) -> Result<Rect, DriverError> {
        self.rect(id)
    }
}

/// Resolves a target to screen coordinates.
///
/// An element without an offset resolves to its center; with an offset, to
/// its origin plus the offset.
pub fn resolve_target(target: &Target, elements: &dyn ElementLocator) -> Result<(f64, f64), DriverError> {
    match target {
        Target::Point { x, y } => Ok((*x, *y)),
        Target::Element { id, offset: None } => Ok(elements.element_rect(id)?.center()),
        Target::Element {
            id,
            offset: Some((dx, dy)),
        } => {
            let rect = elements.element_rect(id)?;
            Ok((rect.x + dx, rect.y + dy))
        }
    }
}

/// One scheduled unit of a pointer's timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Inject a pointer event.
    Pointer(PointerEvent),
    /// Hold the pointer for a while.
    Pause(Duration),
}

/// Compiled steps of one pointer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointerTrack {
    /// Steps in dispatch order.
    pub steps: Vec<Step>,
    /// Releases that had no preceding contact.
    pub idle_releases: usize,
}

/// Compiles one action sequence for pointer `pointer`.
pub fn compile(
    pointer: usize,
    actions: &[GestureAction],
    elements: &dyn ElementLocator,
) -> Result<PointerTrack, DriverError> {
    let mut track = PointerTrack::default();
    let mut down = false;
    let mut position: Option<(f64, f64)> = None;

    let event = |phase, (x, y): (f64, f64)| {
        Step::Pointer(PointerEvent {
            pointer,
            phase,
            x,
            y,
        })
    };

    for (i, action) in actions.iter().enumerate() {
        match action {
            GestureAction::Press(target) => {
                let at = resolve_target(target, elements)?;
                track.steps.push(event(PointerPhase::Down, at));
                down = true;
                position = Some(at);
            }
            GestureAction::LongPress {
                target,
                duration_ms,
            } => {
                let at = resolve_target(target, elements)?;
                track.steps.push(event(PointerPhase::Down, at));
                down = true;
                position = Some(at);
                let waits_next = matches!(actions.get(i + 1), Some(GestureAction::Wait { .. }));
                if !waits_next {
                    track.steps.push(Step::Pause(Duration::from_millis(*duration_ms)));
                }
            }
            GestureAction::MoveTo(target) => {
                let at = resolve_target(target, elements)?;
                if down {
                    track.steps.push(event(PointerPhase::Move, at));
                }
                position = Some(at);
            }
            GestureAction::Release => match (down, position) {
                (true, Some(at)) => {
                    track.steps.push(event(PointerPhase::Up, at));
                    down = false;
                }
                _ => track.idle_releases += 1,
            },
            GestureAction::Wait { ms } => {
                track.steps.push(Step::Pause(Duration::from_millis(*ms)));
            }
            GestureAction::Tap(target) => {
                let at = resolve_target(target, elements)?;
                track.steps.push(event(PointerPhase::Down, at));
                track.steps.push(event(PointerPhase::Up, at));
                down = false;
                position = Some(at);
            }
        }
    }
    Ok(track)
}

/// Summary of a dispatched gesture.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GestureReport {
    /// Events sent to the device, in dispatch order.
    pub events: Vec<PointerEvent>,
    /// Releases that were recorded without a preceding contact.
    pub idle_releases: usize,
}

/// Dispatches compiled touch gestures through a device bridge.
pub struct GestureComposer<'a> {
    bridge: &'a dyn DeviceBridge,
}

impl<'a> GestureComposer<'a> {
    /// Creates a composer for the given device.
    pub fn new(bridge: &'a dyn DeviceBridge) -> Self {
        Self { bridge }
    }

    /// Performs one ordered action sequence.
    pub async fn perform_touch(
        &self,
        actions: &[GestureAction],
        elements: &dyn ElementLocator,
    ) -> Result<GestureReport, DriverError> {
        let track = compile(0, actions, elements)?;
        self.dispatch(vec![track]).await
    }

    /// Performs several sequences as concurrent pointers.
    pub async fn perform_multi_action(
        &self,
        groups: &[Vec<GestureAction>],
        elements: &dyn ElementLocator,
    ) -> Result<GestureReport, DriverError> {
        if groups.is_empty() {
            return Err(DriverError::InvalidArgument(
                "multi-action needs at least one action sequence".into(),
            ));
        }
        let max = self.bridge.max_pointers();
        if groups.len() > max {
            return Err(DriverError::UnsupportedOperation(format!(
                "device supports {} simultaneous pointer(s), multi-action has {}",
                max,
                groups.len()
            )));
        }
        // Resolve every target before the first event goes out.
        let tracks = groups
            .iter()
            .enumerate()
            .map(|(pointer, actions)| compile(pointer, actions, elements))
            .collect::<Result<Vec<_>, _>>()?;
        self.dispatch(tracks).await
    }

    /// Drags from the first point to the last.
    ///
    /// Holds at the start for [`DEFAULT_LONG_PRESS_MS`], moves to the end and
    /// releases there. Exactly two points are accepted.
    pub async fn perform_drag(
        &self,
        points: &[DragPoint],
        elements: &dyn ElementLocator,
    ) -> Result<GestureReport, DriverError> {
        let [DragPoint(start), DragPoint(end)] = points else {
            return Err(DriverError::InvalidArgument(format!(
                "drag needs a start and an end point, got {}",
                points.len()
            )));
        };
        let actions = [
            GestureAction::LongPress {
                target: start.clone(),
                duration_ms: DEFAULT_LONG_PRESS_MS,
            },
            GestureAction::MoveTo(end.clone()),
            GestureAction::Release,
        ];
        self.perform_touch(&actions, elements).await
    }

    async fn dispatch(&self, tracks: Vec<PointerTrack>) -> Result<GestureReport, DriverError> {
        let mut report = GestureReport {
            idle_releases: tracks.iter().map(|t| t.idle_releases).sum(),
            ..Default::default()
        };
        let mut queues: Vec<VecDeque<Step>> =
            tracks.into_iter().map(|t| t.steps.into()).collect();
        let start = Instant::now();
        let mut ready_at = vec![start; queues.len()];
        let mut cursor = 0;

        while queues.iter().any(|q| !q.is_empty()) {
            let now = Instant::now();
            let n = queues.len();
            let pick = (0..n)
                .map(|k| (cursor + k) % n)
                .find(|&g| !queues[g].is_empty() && ready_at[g] <= now);

            let Some(group) = pick else {
                let wake = queues
                    .iter()
                    .zip(&ready_at)
                    .filter(|(q, _)| !q.is_empty())
                    .map(|(_, at)| *at)
                    .min()
                    .unwrap_or(now);
                tokio::time::sleep_until(wake).await;
                continue;
            };

            match queues[group].pop_front() {
                Some(Step::Pointer(event)) => {
                    self.bridge.pointer_event(&event).await?;
                    report.events.push(event);
                }
                Some(Step::Pause(d)) => ready_at[group] = now + d,
                None => {}
            }
            cursor = (group + 1) % n;
        }

        debug!(
            events = report.events.len(),
            idle_releases = report.idle_releases,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "gesture dispatched"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Rects(HashMap<String, Rect>);

    impl ElementLocator for Rects {
        fn element_rect(&self, id: &str) -> Result<Rect, DriverError> {
            self.0
                .get(id)
                .copied()
                .ok_or_else(|| DriverError::NoSuchElement(id.to_string()))
        }
    }

    fn rects() -> Rects {
        let mut map = HashMap::new();
        map.insert(
            "btn".to_string(),
            Rect {
                x: 100.0,
                y: 200.0,
                width: 50.0,
                height: 20.0,
            },
        );
        Rects(map)
    }

    fn point(x: f64, y: f64) -> Target {
        Target::Point { x, y }
    }

    #[test]
    fn test_locator_can_cross_threads() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ElementLocator>();
        assert_send_sync::<Rects>();
    }

    #[test]
    fn test_drag_point_parsing() {
        let points: Vec<DragPoint> = serde_json::from_str(
            r#"[
                {"options": {"element": "btn"}},
                {"options": {"element": "btn", "x": 5, "y": 5}},
                {"options": {"x": 10, "y": 20}}
            ]"#,
        )
        .unwrap();
        assert_eq!(
            points[0].0,
            Target::Element {
                id: "btn".into(),
                offset: None
            }
        );
        assert_eq!(
            points[1].0,
            Target::Element {
                id: "btn".into(),
                offset: Some((5.0, 5.0))
            }
        );
        assert_eq!(points[2].0, point(10.0, 20.0));
        assert!(serde_json::from_str::<DragPoint>(r#"{"options": {"x": 1}}"#).is_err());
    }

    #[test]
    fn test_wire_parsing() {
        let actions: Vec<GestureAction> = serde_json::from_str(
            r#"[
                {"action": "press", "options": {"element": "btn"}},
                {"action": "moveTo", "options": {"element": "btn", "x": 5, "y": 6}},
                {"action": "wait", "options": {"ms": 250}},
                {"action": "longPress", "options": {"x": 1, "y": 2}},
                {"action": "release"}
            ]"#,
        )
        .unwrap();
        assert_eq!(
            actions[0],
            GestureAction::Press(Target::Element {
                id: "btn".into(),
                offset: None
            })
        );
        assert_eq!(
            actions[1],
            GestureAction::MoveTo(Target::Element {
                id: "btn".into(),
                offset: Some((5.0, 6.0))
            })
        );
        assert_eq!(actions[2], GestureAction::Wait { ms: 250 });
        assert_eq!(
            actions[3],
            GestureAction::LongPress {
                target: point(1.0, 2.0),
                duration_ms: DEFAULT_LONG_PRESS_MS
            }
        );
        assert_eq!(actions[4], GestureAction::Release);
    }

    #[test]
    fn test_wire_rejects_missing_target() {
        let result: Result<GestureAction, _> =
            serde_json::from_str(r#"{"action": "press", "options": {"x": 1}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_target() {
        let rects = rects();
        assert_eq!(resolve_target(&point(3.0, 4.0), &rects).unwrap(), (3.0, 4.0));
        let centre = Target::Element {
            id: "btn".into(),
            offset: None,
        };
        assert_eq!(resolve_target(&centre, &rects).unwrap(), (125.0, 210.0));
        let offset = Target::Element {
            id: "btn".into(),
            offset: Some((10.0, 5.0)),
        };
        assert_eq!(resolve_target(&offset, &rects).unwrap(), (110.0, 205.0));
        let missing = Target::Element {
            id: "nope".into(),
            offset: None,
        };
        assert!(matches!(
            resolve_target(&missing, &rects),
            Err(DriverError::NoSuchElement(_))
        ));
    }

    #[test]
    fn test_compile_press_move_release() {
        let track = compile(
            0,
            &[
                GestureAction::Press(point(1.0, 1.0)),
                GestureAction::MoveTo(point(2.0, 2.0)),
                GestureAction::Release,
            ],
            &rects(),
        )
        .unwrap();
        let phases: Vec<_> = track
            .steps
            .iter()
            .map(|s| match s {
                Step::Pointer(e) => (e.phase, e.x),
                Step::Pause(_) => panic!("unexpected pause"),
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                (PointerPhase::Down, 1.0),
                (PointerPhase::Move, 2.0),
                (PointerPhase::Up, 2.0)
            ]
        );
        assert_eq!(track.idle_releases, 0);
    }

    #[test]
    fn test_release_without_contact_is_recorded() {
        let track = compile(0, &[GestureAction::Release], &rects()).unwrap();
        assert!(track.steps.is_empty());
        assert_eq!(track.idle_releases, 1);
    }

    #[test]
    fn test_long_press_hold() {
        let track = compile(
            0,
            &[
                GestureAction::LongPress {
                    target: point(0.0, 0.0),
                    duration_ms: 800,
                },
                GestureAction::Release,
            ],
            &rects(),
        )
        .unwrap();
        assert_eq!(track.steps[1], Step::Pause(Duration::from_millis(800)));

        let track = compile(
            0,
            &[
                GestureAction::LongPress {
                    target: point(0.0, 0.0),
                    duration_ms: 800,
                },
                GestureAction::Wait { ms: 100 },
                GestureAction::Release,
            ],
            &rects(),
        )
        .unwrap();
        assert_eq!(track.steps[1], Step::Pause(Duration::from_millis(100)));
        assert_eq!(track.steps.len(), 3);
    }

    #[test]
    fn test_moveto_before_press_positions_only() {
        let track = compile(
            0,
            &[GestureAction::MoveTo(point(9.0, 9.0)), GestureAction::Release],
            &rects(),
        )
        .unwrap();
        assert!(track.steps.is_empty());
        assert_eq!(track.idle_releases, 1);
    }
}
