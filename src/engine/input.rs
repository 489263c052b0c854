use std::ops::RangeInclusive;

use log::warn;
use openxr as xr;

use crate::engine::haptics::{BufferedCaps, HapticMode, HapticSink};
use crate::engine::pose::{Pose, TrackedMotion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hand {
    Left,
    Right,
}

impl Hand {
    pub fn index(self) -> usize {
        match self {
            Hand::Left => 0,
            Hand::Right => 1,
        }
    }
}

/// Button and touch bit assignments shared across the bitmask fields of
/// [`RemoteSnapshot`].
pub mod buttons {
    pub const TRIGGER: u32 = 1 << 0;
    pub const GRIP: u32 = 1 << 1;
    pub const THUMBSTICK: u32 = 1 << 2;
    pub const TRACKPAD: u32 = 1 << 3;
    pub const A: u32 = 1 << 4;
    pub const B: u32 = 1 << 5;
    pub const X: u32 = 1 << 6;
    pub const Y: u32 = 1 << 7;
    pub const MENU: u32 = 1 << 8;
    pub const BACK: u32 = 1 << 9;
}

/// Device family a raw capability code classifies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Headset,
    TrackedRemote,
    HandTracking,
    Gamepad,
}

/// One row of the vendor classification table: a contiguous range of raw
/// capability type codes and the family they belong to.
#[derive(Debug, Clone)]
pub struct ClassRule {
    pub codes: RangeInclusive<u32>,
    pub family: DeviceFamily,
}

/// Maps raw device-type codes to families. The code ranges are vendor
/// lookup data, so the table is supplied at construction and can be swapped
/// for different hardware generations.
#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    rules: Vec<ClassRule>,
}

impl DeviceClassifier {
    pub fn new(rules: Vec<ClassRule>) -> Self {
        Self { rules }
    }

    /// Table for the current hardware generation.
    pub fn standard() -> Self {
        Self::new(vec![
            ClassRule {
                codes: 4..=7,
                family: DeviceFamily::TrackedRemote,
            },
            ClassRule {
                codes: 8..=15,
                family: DeviceFamily::Headset,
            },
            ClassRule {
                codes: 16..=31,
                family: DeviceFamily::Gamepad,
            },
            ClassRule {
                codes: 32..=63,
                family: DeviceFamily::HandTracking,
            },
        ])
    }

    pub fn classify(&self, type_code: u32) -> Option<DeviceFamily> {
        self.rules
            .iter()
            .find(|rule| rule.codes.contains(&type_code))
            .map(|rule| rule.family)
    }
}

/// Haptic support reported by a device at enumeration time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HapticCapability {
    None,
    Simple,
    Buffered(BufferedCaps),
}

/// Enumeration record for one connected device, before unpacking.
#[derive(Debug, Clone)]
pub struct RawDeviceInfo {
    pub id: u64,
    pub type_code: u32,
    /// Derived from capability flags every frame; enumeration order is not
    /// stable, so hand assignment must never rely on list position.
    pub hand: Option<Hand>,
    pub haptics: HapticCapability,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadsetSnapshot {
    pub back_down: bool,
    pub touch_position: Option<[f32; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub hand: Hand,
    pub tracking: TrackedMotion,
    pub buttons_down: u32,
    pub buttons_changed: u32,
    pub touches: u32,
    pub trigger: f32,
    pub grip: f32,
    /// Trackpad or joystick axis, whichever the hardware model carries.
    pub axis: [f32; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandSnapshot {
    pub hand: Hand,
    pub root: Pose,
    /// World-space bone poses after forward kinematics.
    pub bones: Vec<Pose>,
    pub confidence: f32,
    pub scale: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GamepadSnapshot {
    pub back_down: bool,
}

/// Per-frame unpacked state of one device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSnapshot {
    Headset(HeadsetSnapshot),
    TrackedRemote(RemoteSnapshot),
    HandTracking(HandSnapshot),
    Gamepad(GamepadSnapshot),
}

/// Hand-skeleton bone hierarchy with bind poses in parent-local space.
/// Parents always precede children in the bone array.
#[derive(Debug, Clone, PartialEq)]
pub struct SkeletonTopology {
    pub parents: Vec<Option<usize>>,
    pub bind_poses: Vec<Pose>,
}

/// Raw per-frame hand state: root pose plus per-bone rotations in
/// parent-local space, `[w, x, y, z]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHandPose {
    pub root: Pose,
    pub bone_rotations: Vec<[f32; 4]>,
    pub confidence: f32,
    pub scale: f32,
}

/// Platform input queries, one call family per device family. The runtime
/// implementation sits on the session's action state; tests drive the
/// enumerator with synthetic sources.
pub trait InputSource {
    fn enumerate(&mut self) -> anyhow::Result<Vec<RawDeviceInfo>>;
    fn headset_state(&mut self, device: &RawDeviceInfo) -> anyhow::Result<HeadsetSnapshot>;
    fn remote_state(
        &mut self,
        device: &RawDeviceInfo,
        hand: Hand,
        display_time: xr::Time,
    ) -> anyhow::Result<RemoteSnapshot>;
    fn gamepad_state(&mut self, device: &RawDeviceInfo) -> anyhow::Result<GamepadSnapshot>;
    fn hand_topology(&mut self, hand: Hand) -> anyhow::Result<SkeletonTopology>;
    fn hand_pose(&mut self, hand: Hand, display_time: xr::Time) -> anyhow::Result<RawHandPose>;
    /// Hardware endpoint for the given device's vibration calls.
    fn haptic_sink(&mut self, device: &RawDeviceInfo) -> anyhow::Result<Box<dyn HapticSink>>;
}

/// A newly discovered haptic-capable device, to be registered with the
/// haptics engine wherever it lives.
pub struct HapticBinding {
    pub slot: usize,
    pub device_id: u64,
    pub mode: HapticMode,
    pub caps: Option<BufferedCaps>,
    pub sink: Box<dyn HapticSink>,
}

/// Everything one frame's device walk produced.
#[derive(Default)]
pub struct PolledInput {
    pub devices: Vec<DeviceSnapshot>,
    pub haptic_bindings: Vec<HapticBinding>,
    /// Set on the frame the back-button short-press gesture completes.
    pub quit_requested: bool,
}

/// Walks the connected-device list once per frame, unpacking each device
/// into a [`DeviceSnapshot`] and keeping the small amount of cross-frame
/// state the walk needs: cached skeleton topologies and the back-button
/// edge detector.
pub struct InputEnumerator {
    classifier: DeviceClassifier,
    topology_cache: [Option<SkeletonTopology>; 2],
    /// Mirror of the haptics engine's slot assignments, so a binding is
    /// emitted once per connect rather than every frame.
    bound_devices: [Option<u64>; 2],
    back_was_down: bool,
}

impl InputEnumerator {
    pub fn new(classifier: DeviceClassifier) -> Self {
        Self {
            classifier,
            topology_cache: [None, None],
            bound_devices: [None, None],
            back_was_down: false,
        }
    }

    /// Drops cached per-device state, forcing topology re-query and haptic
    /// re-binding on the next poll. Called when the session loses its
    /// devices.
    pub fn reset(&mut self) {
        self.topology_cache = [None, None];
        self.bound_devices = [None, None];
        self.back_was_down = false;
    }

    /// One frame's enumeration pass. A failing per-device query skips that
    /// device for this frame only.
    pub fn poll(&mut self, source: &mut dyn InputSource, display_time: xr::Time) -> PolledInput {
        let mut polled = PolledInput::default();
        let raw_devices = match source.enumerate() {
            Ok(devices) => devices,
            Err(err) => {
                warn!("Device enumeration failed: {:?}", err);
                self.back_was_down = false;
                return polled;
            }
        };

        let mut back_down = false;
        for raw in &raw_devices {
            let family = match self.classifier.classify(raw.type_code) {
                Some(family) => family,
                None => continue,
            };
            let snapshot = match family {
                DeviceFamily::Headset => match source.headset_state(raw) {
                    Ok(state) => {
                        back_down |= state.back_down;
                        DeviceSnapshot::Headset(state)
                    }
                    Err(err) => {
                        warn!("Headset state query failed: {:?}", err);
                        continue;
                    }
                },
                DeviceFamily::TrackedRemote => {
                    let hand = match raw.hand {
                        Some(hand) => hand,
                        None => continue,
                    };
                    match source.remote_state(raw, hand, display_time) {
                        Ok(state) => {
                            back_down |= state.buttons_down & buttons::BACK != 0;
                            if let Some(binding) = self.bind_haptics(source, raw, hand) {
                                polled.haptic_bindings.push(binding);
                            }
                            DeviceSnapshot::TrackedRemote(state)
                        }
                        Err(err) => {
                            warn!("Remote state query failed: {:?}", err);
                            continue;
                        }
                    }
                }
                DeviceFamily::HandTracking => {
                    let hand = match raw.hand {
                        Some(hand) => hand,
                        None => continue,
                    };
                    match self.unpack_hand(source, hand, display_time) {
                        Ok(state) => DeviceSnapshot::HandTracking(state),
                        Err(err) => {
                            warn!("Hand tracking query failed: {:?}", err);
                            continue;
                        }
                    }
                }
                DeviceFamily::Gamepad => match source.gamepad_state(raw) {
                    Ok(state) => {
                        back_down |= state.back_down;
                        DeviceSnapshot::Gamepad(state)
                    }
                    Err(err) => {
                        warn!("Gamepad state query failed: {:?}", err);
                        continue;
                    }
                },
            };
            polled.devices.push(snapshot);
        }

        // Short press fires on release, exactly once per down-to-up edge.
        polled.quit_requested = self.back_was_down && !back_down;
        self.back_was_down = back_down;
        polled
    }

    fn bind_haptics(
        &mut self,
        source: &mut dyn InputSource,
        raw: &RawDeviceInfo,
        hand: Hand,
    ) -> Option<HapticBinding> {
        let slot = hand.index();
        if self.bound_devices[slot] == Some(raw.id) {
            return None;
        }
        let (mode, caps) = match raw.haptics {
            HapticCapability::None => return None,
            HapticCapability::Simple => (HapticMode::Simple, None),
            HapticCapability::Buffered(caps) => (HapticMode::Buffered, Some(caps)),
        };
        match source.haptic_sink(raw) {
            Ok(sink) => {
                self.bound_devices[slot] = Some(raw.id);
                Some(HapticBinding {
                    slot,
                    device_id: raw.id,
                    mode,
                    caps,
                    sink,
                })
            }
            Err(err) => {
                warn!("Cannot open haptic channel for device {}: {:?}", raw.id, err);
                None
            }
        }
    }

    /// Hand unpack: topology is queried once per hand and cached, the
    /// per-frame pose is combined with it through forward kinematics.
    fn unpack_hand(
        &mut self,
        source: &mut dyn InputSource,
        hand: Hand,
        display_time: xr::Time,
    ) -> anyhow::Result<HandSnapshot> {
        if self.topology_cache[hand.index()].is_none() {
            self.topology_cache[hand.index()] = Some(source.hand_topology(hand)?);
        }
        let pose = source.hand_pose(hand, display_time)?;
        // Borrow after the fill-in above so the cache entry is always live.
        let topology = self.topology_cache[hand.index()]
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Hand topology cache is empty"))?;
        let bones = forward_kinematics(topology, &pose);
        Ok(HandSnapshot {
            hand,
            root: pose.root,
            bones,
            confidence: pose.confidence,
            scale: pose.scale,
        })
    }
}

/// Resolves per-bone world poses from the bind-pose hierarchy and the
/// frame's local rotations. Bones with no parent chain from the root pose.
fn forward_kinematics(topology: &SkeletonTopology, pose: &RawHandPose) -> Vec<Pose> {
    let bone_count = topology.parents.len().min(topology.bind_poses.len());
    let mut world = Vec::with_capacity(bone_count);
    for index in 0..bone_count {
        let bind = &topology.bind_poses[index];
        let rotation = pose
            .bone_rotations
            .get(index)
            .copied()
            .unwrap_or([1.0, 0.0, 0.0, 0.0]);
        let local = Pose {
            position: bind.position,
            orientation: rotation,
        };
        let parent_world = match topology.parents[index] {
            Some(parent) if parent < index => world[parent],
            _ => pose.root,
        };
        world.push(parent_world.transform(&local));
    }
    world
}

#[cfg(test)]
mod test {
    use super::*;

    /// Scripted source: per-frame device lists plus query counters.
    struct ScriptedSource {
        frames: Vec<Vec<RawDeviceInfo>>,
        frame: usize,
        back_down_frames: Vec<bool>,
        topology_queries: usize,
        pose_queries: usize,
    }

    impl ScriptedSource {
        fn back_button_script(states: &[bool]) -> Self {
            Self {
                frames: states
                    .iter()
                    .map(|_| {
                        vec![RawDeviceInfo {
                            id: 1,
                            type_code: 8,
                            hand: None,
                            haptics: HapticCapability::None,
                        }]
                    })
                    .collect(),
                frame: 0,
                back_down_frames: states.to_vec(),
                topology_queries: 0,
                pose_queries: 0,
            }
        }

        fn hand_script(frame_count: usize) -> Self {
            Self {
                frames: (0..frame_count)
                    .map(|_| {
                        vec![RawDeviceInfo {
                            id: 2,
                            type_code: 32,
                            hand: Some(Hand::Left),
                            haptics: HapticCapability::None,
                        }]
                    })
                    .collect(),
                frame: 0,
                back_down_frames: vec![false; frame_count],
                topology_queries: 0,
                pose_queries: 0,
            }
        }
    }

    impl InputSource for ScriptedSource {
        fn enumerate(&mut self) -> anyhow::Result<Vec<RawDeviceInfo>> {
            let devices = self.frames[self.frame].clone();
            self.frame += 1;
            Ok(devices)
        }

        fn headset_state(&mut self, _device: &RawDeviceInfo) -> anyhow::Result<HeadsetSnapshot> {
            Ok(HeadsetSnapshot {
                back_down: self.back_down_frames[self.frame - 1],
                touch_position: None,
            })
        }

        fn remote_state(
            &mut self,
            _device: &RawDeviceInfo,
            hand: Hand,
            _display_time: xr::Time,
        ) -> anyhow::Result<RemoteSnapshot> {
            Ok(RemoteSnapshot {
                hand,
                tracking: TrackedMotion::default(),
                buttons_down: 0,
                buttons_changed: 0,
                touches: 0,
                trigger: 0.0,
                grip: 0.0,
                axis: [0.0; 2],
            })
        }

        fn gamepad_state(&mut self, _device: &RawDeviceInfo) -> anyhow::Result<GamepadSnapshot> {
            Ok(GamepadSnapshot { back_down: false })
        }

        fn hand_topology(&mut self, _hand: Hand) -> anyhow::Result<SkeletonTopology> {
            self.topology_queries += 1;
            Ok(SkeletonTopology {
                parents: vec![None, Some(0), Some(1)],
                bind_poses: vec![
                    Pose::default(),
                    Pose {
                        position: [0.0, 0.0, -0.1],
                        ..Pose::default()
                    },
                    Pose {
                        position: [0.0, 0.0, -0.1],
                        ..Pose::default()
                    },
                ],
            })
        }

        fn hand_pose(&mut self, _hand: Hand, _display_time: xr::Time) -> anyhow::Result<RawHandPose> {
            self.pose_queries += 1;
            Ok(RawHandPose {
                root: Pose {
                    position: [0.0, 1.0, 0.0],
                    ..Pose::default()
                },
                bone_rotations: vec![[1.0, 0.0, 0.0, 0.0]; 3],
                confidence: 1.0,
                scale: 1.0,
            })
        }

        fn haptic_sink(&mut self, _device: &RawDeviceInfo) -> anyhow::Result<Box<dyn HapticSink>> {
            anyhow::bail!("no haptics in scripted source")
        }
    }

    fn poll_all(source: &mut ScriptedSource, frames: usize) -> Vec<bool> {
        let mut enumerator = InputEnumerator::new(DeviceClassifier::standard());
        (0..frames)
            .map(|_| {
                enumerator
                    .poll(source, xr::Time::from_nanos(0))
                    .quit_requested
            })
            .collect()
    }

    #[test]
    fn back_button_fires_once_on_release() {
        let mut source = ScriptedSource::back_button_script(&[true, true, false, false]);
        let fired = poll_all(&mut source, 4);
        assert_eq!(fired, vec![false, false, true, false]);
    }

    #[test]
    fn back_button_never_fires_while_held_or_idle() {
        let mut source = ScriptedSource::back_button_script(&[false, true, true, true]);
        let fired = poll_all(&mut source, 4);
        assert!(fired.iter().all(|f| !f));
    }

    #[test]
    fn skeleton_topology_is_queried_once_per_hand() {
        let mut source = ScriptedSource::hand_script(3);
        let mut enumerator = InputEnumerator::new(DeviceClassifier::standard());
        for _ in 0..3 {
            enumerator.poll(&mut source, xr::Time::from_nanos(0));
        }
        assert_eq!(source.topology_queries, 1);
        assert_eq!(source.pose_queries, 3);
    }

    #[test]
    fn forward_kinematics_chains_bind_offsets() {
        let mut source = ScriptedSource::hand_script(1);
        let mut enumerator = InputEnumerator::new(DeviceClassifier::standard());
        let polled = enumerator.poll(&mut source, xr::Time::from_nanos(0));

        let Some(DeviceSnapshot::HandTracking(hand)) = polled.devices.first() else {
            panic!("expected a hand snapshot");
        };
        assert_eq!(hand.bones.len(), 3);
        assert_eq!(hand.bones[0].position, [0.0, 1.0, 0.0]);
        assert_eq!(hand.bones[1].position, [0.0, 1.0, -0.1]);
        let tip = hand.bones[2].position;
        assert!((tip[2] - -0.2).abs() < 1e-6);
    }

    #[test]
    fn unknown_type_codes_are_skipped() {
        let classifier = DeviceClassifier::standard();
        assert_eq!(classifier.classify(5), Some(DeviceFamily::TrackedRemote));
        assert_eq!(classifier.classify(200), None);
    }

    #[test]
    fn classification_table_is_swappable() {
        let classifier = DeviceClassifier::new(vec![ClassRule {
            codes: 100..=100,
            family: DeviceFamily::Headset,
        }]);
        assert_eq!(classifier.classify(100), Some(DeviceFamily::Headset));
        assert_eq!(classifier.classify(8), None);
    }
}
