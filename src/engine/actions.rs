use anyhow::{Context, Result};
use cgmath::{InnerSpace, Quaternion, Rotation};
use log::{info, warn};
use openxr as xr;

use crate::engine::haptics::HapticSink;
use crate::engine::input::{
    buttons, GamepadSnapshot, Hand, HapticCapability, HeadsetSnapshot, InputSource, RawDeviceInfo,
    RawHandPose, RemoteSnapshot, SkeletonTopology,
};
use crate::engine::pose::{Pose, TrackedMotion};

const HEADSET_ID: u64 = 1;
const REMOTE_ID_BASE: u64 = 100;
const HAND_ID_BASE: u64 = 200;

const HEADSET_TYPE_CODE: u32 = 8;
const REMOTE_TYPE_CODE: u32 = 4;
const HAND_TYPE_CODE: u32 = 32;

/// Parent of each of the 26 standard hand joints (palm, wrist, then five
/// fingers of five joints each). Wrist is the root; palm and the
/// metacarpals hang off it.
const HAND_JOINT_PARENTS: [Option<usize>; 26] = [
    Some(1),
    None,
    Some(1),
    Some(2),
    Some(3),
    Some(4),
    Some(1),
    Some(6),
    Some(7),
    Some(8),
    Some(9),
    Some(1),
    Some(11),
    Some(12),
    Some(13),
    Some(14),
    Some(1),
    Some(16),
    Some(17),
    Some(18),
    Some(19),
    Some(1),
    Some(21),
    Some(22),
    Some(23),
    Some(24),
];
const WRIST_JOINT: usize = 1;

/// Action-based input backend for a live session. One action set covers
/// both hands through subaction paths; hand tracking rides on the optional
/// runtime extension.
pub struct XrInputSource {
    session: xr::Session<xr::Vulkan>,
    action_set: xr::ActionSet,
    hand_paths: [xr::Path; 2],
    grip_spaces: [xr::Space; 2],
    stage_space: xr::Space,
    pose_action: xr::Action<xr::Posef>,
    trigger: xr::Action<f32>,
    trigger_touch: xr::Action<bool>,
    grip: xr::Action<f32>,
    stick: xr::Action<xr::Vector2f>,
    stick_click: xr::Action<bool>,
    stick_touch: xr::Action<bool>,
    primary: xr::Action<bool>,
    secondary: xr::Action<bool>,
    menu: xr::Action<bool>,
    back: xr::Action<bool>,
    haptic: xr::Action<xr::Haptic>,
    hand_trackers: [Option<xr::HandTracker>; 2],
    display_time: xr::Time,
}

impl XrInputSource {
    pub fn new(instance: &xr::Instance, session: xr::Session<xr::Vulkan>) -> Result<Self> {
        let action_set = instance
            .create_action_set("frame_bridge", "Frame Bridge", 0)
            .context("Cannot create action set")?;

        let left = instance.string_to_path("/user/hand/left")?;
        let right = instance.string_to_path("/user/hand/right")?;
        let hand_paths = [left, right];

        let pose_action = action_set.create_action("hand_pose", "Hand Pose", &hand_paths)?;
        let trigger = action_set.create_action("trigger", "Trigger", &hand_paths)?;
        let trigger_touch =
            action_set.create_action("trigger_touch", "Trigger Touch", &hand_paths)?;
        let grip = action_set.create_action("grip", "Grip", &hand_paths)?;
        let stick = action_set.create_action("thumbstick", "Thumbstick", &hand_paths)?;
        let stick_click =
            action_set.create_action("thumbstick_click", "Thumbstick Click", &hand_paths)?;
        let stick_touch =
            action_set.create_action("thumbstick_touch", "Thumbstick Touch", &hand_paths)?;
        let primary = action_set.create_action("primary", "Primary Button", &hand_paths)?;
        let secondary = action_set.create_action("secondary", "Secondary Button", &hand_paths)?;
        let menu = action_set.create_action("menu", "Menu Button", &hand_paths)?;
        let back = action_set.create_action("back", "Back Button", &hand_paths)?;
        let haptic = action_set.create_action("vibrate", "Vibration", &hand_paths)?;

        suggest_bindings(
            instance,
            "/interaction_profiles/oculus/touch_controller",
            &[
                (trigger.as_binding(), "input/trigger/value"),
                (trigger_touch.as_binding(), "input/trigger/touch"),
                (grip.as_binding(), "input/squeeze/value"),
                (stick.as_binding(), "input/thumbstick"),
                (stick_click.as_binding(), "input/thumbstick/click"),
                (stick_touch.as_binding(), "input/thumbstick/touch"),
                (pose_action.as_binding(), "input/grip/pose"),
                (haptic.as_binding(), "output/haptic"),
            ],
            &[
                (primary.as_binding(), "/user/hand/left/input/x/click"),
                (primary.as_binding(), "/user/hand/right/input/a/click"),
                (secondary.as_binding(), "/user/hand/left/input/y/click"),
                (secondary.as_binding(), "/user/hand/right/input/b/click"),
                (menu.as_binding(), "/user/hand/left/input/menu/click"),
            ],
        )?;
        suggest_bindings(
            instance,
            "/interaction_profiles/khr/simple_controller",
            &[
                (pose_action.as_binding(), "input/grip/pose"),
                (primary.as_binding(), "input/select/click"),
                (back.as_binding(), "input/menu/click"),
                (haptic.as_binding(), "output/haptic"),
            ],
            &[],
        )?;

        session
            .attach_action_sets(&[&action_set])
            .context("Cannot attach action sets")?;

        let grip_spaces = [
            pose_action.create_space(session.clone(), left, xr::Posef::IDENTITY)?,
            pose_action.create_space(session.clone(), right, xr::Posef::IDENTITY)?,
        ];
        let stage_space = session
            .create_reference_space(xr::ReferenceSpaceType::STAGE, xr::Posef::IDENTITY)?;

        let hand_trackers = [
            try_create_hand_tracker(&session, xr::HandEXT::LEFT),
            try_create_hand_tracker(&session, xr::HandEXT::RIGHT),
        ];

        Ok(Self {
            session,
            action_set,
            hand_paths,
            grip_spaces,
            stage_space,
            pose_action,
            trigger,
            trigger_touch,
            grip,
            stick,
            stick_click,
            stick_touch,
            primary,
            secondary,
            menu,
            back,
            haptic,
            hand_trackers,
            display_time: xr::Time::from_nanos(0),
        })
    }

    /// Timestamp used for pose queries in this frame's enumeration pass.
    pub fn set_display_time(&mut self, display_time: xr::Time) {
        self.display_time = display_time;
    }

    fn hand_joints(
        &self,
        hand: Hand,
    ) -> Result<Option<[xr::HandJointLocation; xr::HAND_JOINT_COUNT]>> {
        let tracker = self.hand_trackers[hand.index()]
            .as_ref()
            .context("No hand tracker for this hand")?;
        Ok(self
            .stage_space
            .locate_hand_joints(tracker, self.display_time)?)
    }
}

fn try_create_hand_tracker(
    session: &xr::Session<xr::Vulkan>,
    hand: xr::HandEXT,
) -> Option<xr::HandTracker> {
    match session.create_hand_tracker(hand) {
        Ok(tracker) => Some(tracker),
        Err(err) => {
            info!("Hand tracking unavailable: {}", err);
            None
        }
    }
}

/// Suggests bindings for one interaction profile. `both_hands` entries are
/// bound under each hand's subaction path; `absolute` entries carry a full
/// path already.
fn suggest_bindings(
    instance: &xr::Instance,
    profile: &str,
    both_hands: &[(BindingRef<'_>, &str)],
    absolute: &[(BindingRef<'_>, &str)],
) -> Result<()> {
    let mut bindings = Vec::with_capacity(both_hands.len() * 2 + absolute.len());
    for (action, suffix) in both_hands {
        for side in ["/user/hand/left", "/user/hand/right"] {
            let path = instance.string_to_path(&format!("{}/{}", side, suffix))?;
            bindings.push(action.binding(path));
        }
    }
    for (action, full_path) in absolute {
        let path = instance.string_to_path(full_path)?;
        bindings.push(action.binding(path));
    }
    let profile_path = instance.string_to_path(profile)?;
    if let Err(err) = instance.suggest_interaction_profile_bindings(profile_path, &bindings) {
        warn!("Binding suggestion rejected for {}: {}", profile, err);
    }
    Ok(())
}

/// Type-erased action reference, so one suggestion table can mix action
/// types.
pub enum BindingRef<'a> {
    Bool(&'a xr::Action<bool>),
    Float(&'a xr::Action<f32>),
    Vector(&'a xr::Action<xr::Vector2f>),
    Pose(&'a xr::Action<xr::Posef>),
    Haptic(&'a xr::Action<xr::Haptic>),
}

impl BindingRef<'_> {
    fn binding(&self, path: xr::Path) -> xr::Binding<'_> {
        match self {
            BindingRef::Bool(action) => xr::Binding::new(action, path),
            BindingRef::Float(action) => xr::Binding::new(action, path),
            BindingRef::Vector(action) => xr::Binding::new(action, path),
            BindingRef::Pose(action) => xr::Binding::new(action, path),
            BindingRef::Haptic(action) => xr::Binding::new(action, path),
        }
    }
}

trait AsBinding: Sized {
    fn as_binding(&self) -> BindingRef<'_>;
}

impl AsBinding for xr::Action<bool> {
    fn as_binding(&self) -> BindingRef<'_> {
        BindingRef::Bool(self)
    }
}

impl AsBinding for xr::Action<f32> {
    fn as_binding(&self) -> BindingRef<'_> {
        BindingRef::Float(self)
    }
}

impl AsBinding for xr::Action<xr::Vector2f> {
    fn as_binding(&self) -> BindingRef<'_> {
        BindingRef::Vector(self)
    }
}

impl AsBinding for xr::Action<xr::Posef> {
    fn as_binding(&self) -> BindingRef<'_> {
        BindingRef::Pose(self)
    }
}

impl AsBinding for xr::Action<xr::Haptic> {
    fn as_binding(&self) -> BindingRef<'_> {
        BindingRef::Haptic(self)
    }
}

impl InputSource for XrInputSource {
    fn enumerate(&mut self) -> Result<Vec<RawDeviceInfo>> {
        self.session
            .sync_actions(&[xr::ActiveActionSet::new(&self.action_set)])
            .context("Cannot sync actions")?;

        let mut devices = vec![RawDeviceInfo {
            id: HEADSET_ID,
            type_code: HEADSET_TYPE_CODE,
            hand: None,
            haptics: HapticCapability::None,
        }];
        for hand in [Hand::Left, Hand::Right] {
            let path = self.hand_paths[hand.index()];
            if self.pose_action.is_active(&self.session, path)? {
                devices.push(RawDeviceInfo {
                    id: REMOTE_ID_BASE + hand.index() as u64,
                    type_code: REMOTE_TYPE_CODE,
                    hand: Some(hand),
                    // The runtime's haptic channel is amplitude-only.
                    haptics: HapticCapability::Simple,
                });
            }
            if self.hand_trackers[hand.index()].is_some() {
                if let Ok(Some(joints)) = self.hand_joints(hand) {
                    if joints[WRIST_JOINT]
                        .location_flags
                        .contains(xr::SpaceLocationFlags::POSITION_VALID)
                    {
                        devices.push(RawDeviceInfo {
                            id: HAND_ID_BASE + hand.index() as u64,
                            type_code: HAND_TYPE_CODE,
                            hand: Some(hand),
                            haptics: HapticCapability::None,
                        });
                    }
                }
            }
        }
        Ok(devices)
    }

    fn headset_state(&mut self, _device: &RawDeviceInfo) -> Result<HeadsetSnapshot> {
        // Headset-mounted controls beyond the system button are not
        // reachable through the action system.
        Ok(HeadsetSnapshot::default())
    }

    fn remote_state(
        &mut self,
        _device: &RawDeviceInfo,
        hand: Hand,
        display_time: xr::Time,
    ) -> Result<RemoteSnapshot> {
        let path = self.hand_paths[hand.index()];
        let session = &self.session;

        let mut buttons_down = 0;
        let mut buttons_changed = 0;
        let mut touches = 0;
        let mut read_button = |action: &xr::Action<bool>, bit: u32| -> Result<()> {
            let state = action.state(session, path)?;
            if state.is_active {
                if state.current_state {
                    buttons_down |= bit;
                }
                if state.changed_since_last_sync {
                    buttons_changed |= bit;
                }
            }
            Ok(())
        };
        read_button(&self.stick_click, buttons::THUMBSTICK)?;
        read_button(&self.primary, if hand == Hand::Left { buttons::X } else { buttons::A })?;
        read_button(&self.secondary, if hand == Hand::Left { buttons::Y } else { buttons::B })?;
        read_button(&self.menu, buttons::MENU)?;
        read_button(&self.back, buttons::BACK)?;

        if self.trigger_touch.state(session, path)?.current_state {
            touches |= buttons::TRIGGER;
        }
        if self.stick_touch.state(session, path)?.current_state {
            touches |= buttons::THUMBSTICK;
        }

        let trigger = self.trigger.state(session, path)?.current_state;
        let grip = self.grip.state(session, path)?.current_state;
        let stick = self.stick.state(session, path)?.current_state;

        let tracking = match self.grip_spaces[hand.index()].relate(&self.stage_space, display_time)
        {
            Ok((location, velocity)) => TrackedMotion::from_xr(&location.pose, Some(&velocity)),
            Err(err) => {
                warn!("Controller pose query failed: {}", err);
                TrackedMotion::default()
            }
        };

        Ok(RemoteSnapshot {
            hand,
            tracking,
            buttons_down,
            buttons_changed,
            touches,
            trigger,
            grip,
            axis: [stick.x, stick.y],
        })
    }

    fn gamepad_state(&mut self, _device: &RawDeviceInfo) -> Result<GamepadSnapshot> {
        // Gamepads are not surfaced through this backend.
        Ok(GamepadSnapshot::default())
    }

    /// The runtime reports world-space joints, not a static skeleton; the
    /// topology is the fixed joint hierarchy with bind offsets captured
    /// from the first valid joint set.
    fn hand_topology(&mut self, hand: Hand) -> Result<SkeletonTopology> {
        let joints = self
            .hand_joints(hand)?
            .context("Hand joints unavailable")?;
        let world: Vec<Pose> = joints.iter().map(|j| Pose::from_xr(&j.pose)).collect();
        let bind_poses = HAND_JOINT_PARENTS
            .iter()
            .enumerate()
            .map(|(index, parent)| match parent {
                Some(parent) => local_pose(&world[*parent], &world[index]),
                None => Pose::default(),
            })
            .collect();
        Ok(SkeletonTopology {
            parents: HAND_JOINT_PARENTS.to_vec(),
            bind_poses,
        })
    }

    fn hand_pose(&mut self, hand: Hand, _display_time: xr::Time) -> Result<RawHandPose> {
        let joints = self
            .hand_joints(hand)?
            .context("Hand joints unavailable")?;
        let world: Vec<Pose> = joints.iter().map(|j| Pose::from_xr(&j.pose)).collect();
        let bone_rotations = HAND_JOINT_PARENTS
            .iter()
            .enumerate()
            .map(|(index, parent)| match parent {
                Some(parent) => local_pose(&world[*parent], &world[index]).orientation,
                None => world[index].orientation,
            })
            .collect();
        let valid_joints = joints
            .iter()
            .filter(|j| {
                j.location_flags
                    .contains(xr::SpaceLocationFlags::POSITION_VALID)
            })
            .count();
        Ok(RawHandPose {
            root: world[WRIST_JOINT],
            bone_rotations,
            confidence: valid_joints as f32 / joints.len() as f32,
            scale: 1.0,
        })
    }

    fn haptic_sink(&mut self, device: &RawDeviceInfo) -> Result<Box<dyn HapticSink>> {
        let hand = device.hand.context("Haptic device has no hand")?;
        Ok(Box::new(XrHapticSink {
            session: self.session.clone(),
            action: self.haptic.clone(),
            path: self.hand_paths[hand.index()],
        }))
    }
}

/// `child` expressed in `parent`'s local frame.
fn local_pose(parent: &Pose, child: &Pose) -> Pose {
    let parent_rotation = Quaternion::new(
        parent.orientation[0],
        parent.orientation[1],
        parent.orientation[2],
        parent.orientation[3],
    );
    let child_rotation = Quaternion::new(
        child.orientation[0],
        child.orientation[1],
        child.orientation[2],
        child.orientation[3],
    );
    let inverse = parent_rotation.invert();
    let local_rotation = (inverse * child_rotation).normalize();
    let offset = inverse
        * cgmath::Vector3::new(
            child.position[0] - parent.position[0],
            child.position[1] - parent.position[1],
            child.position[2] - parent.position[2],
        );
    Pose {
        position: [offset.x, offset.y, offset.z],
        orientation: [
            local_rotation.s,
            local_rotation.v.x,
            local_rotation.v.y,
            local_rotation.v.z,
        ],
    }
}

/// Amplitude-only hardware endpoint on the runtime's haptic action.
struct XrHapticSink {
    session: xr::Session<xr::Vulkan>,
    action: xr::Action<xr::Haptic>,
    path: xr::Path,
}

impl HapticSink for XrHapticSink {
    fn set_amplitude(&mut self, amplitude: f32) -> Result<()> {
        if amplitude <= 0.0 {
            self.action.stop_feedback(&self.session, self.path)?;
        } else {
            let event = xr::HapticVibration::new()
                .amplitude(amplitude)
                .duration(xr::Duration::MIN_HAPTIC);
            self.action.apply_feedback(&self.session, self.path, &event)?;
        }
        Ok(())
    }

    fn submit_samples(&mut self, samples: &[u8], _terminated: bool) -> Result<()> {
        // No sample-buffer call exists on this runtime; play the chunk as
        // one event at its mean amplitude. Buffered devices never appear
        // through this backend, so this is a safety net only.
        if samples.is_empty() {
            return Ok(());
        }
        let mean = samples.iter().map(|&s| s as f32).sum::<f32>() / samples.len() as f32 / 255.0;
        self.set_amplitude(mean)
    }
}
