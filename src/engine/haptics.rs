use log::warn;
use thiserror::Error;

/// Hand slots with vibration support. Matches the two tracked controllers.
pub const MAX_HAPTIC_DEVICES: usize = 2;

#[derive(Error, Debug)]
pub enum HapticError {
    #[error("haptic call budget for this frame is exhausted")]
    BudgetExhausted,
    #[error("no haptic-capable device registered in slot {0}")]
    EmptySlot(usize),
}

/// Vibration capability reported by a buffered-haptics device at connect
/// time. Buffers are sized from these, never from compile-time constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedCaps {
    /// Largest sample count the device accepts in one submission.
    pub samples_max: usize,
    /// Playback duration of a single sample, in milliseconds.
    pub sample_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticMode {
    Simple,
    Buffered,
}

/// Hardware submission endpoint for one device. The runtime implementation
/// forwards to the platform's haptic calls; tests count invocations.
pub trait HapticSink: Send {
    /// Simple-mode "set current amplitude". Zero stops the motor.
    fn set_amplitude(&mut self, amplitude: f32) -> anyhow::Result<()>;
    /// Buffered-mode chunk submission. `terminated` marks the final chunk of
    /// the current effect.
    fn submit_samples(&mut self, samples: &[u8], terminated: bool) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Vibration {
    Idle,
    /// The simple API has no duration parameter; expiry is emulated
    /// client-side with one-frame granularity.
    Simple { clear_at: f64 },
    Buffered {
        tail_length: u32,
        remaining_length: u32,
        strength: f32,
        submit_time: f64,
        tail_at: u32,
    },
}

struct DeviceSlot {
    device_id: u64,
    mode: HapticMode,
    caps: Option<BufferedCaps>,
    sink: Box<dyn HapticSink>,
    can_call_this_frame: bool,
    vibration: Vibration,
}

/// Per-controller vibration state machine.
///
/// The hardware accepts at most one haptic call per device per frame; every
/// path that reaches a sink goes through the `can_call_this_frame` gate,
/// which `begin_frame` resets once per loop iteration.
pub struct HapticsEngine {
    slots: [Option<DeviceSlot>; MAX_HAPTIC_DEVICES],
}

impl Default for HapticsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HapticsEngine {
    pub fn new() -> Self {
        Self {
            slots: [None, None],
        }
    }

    /// Binds a device to a hand slot. The mode is fixed for the lifetime of
    /// the binding; reconnecting a different device rebinds the slot with
    /// whatever mode that device supports.
    pub fn register(
        &mut self,
        slot: usize,
        device_id: u64,
        mode: HapticMode,
        caps: Option<BufferedCaps>,
        sink: Box<dyn HapticSink>,
    ) {
        if slot >= MAX_HAPTIC_DEVICES {
            return;
        }
        if let Some(existing) = &self.slots[slot] {
            if existing.device_id == device_id {
                return;
            }
        }
        self.slots[slot] = Some(DeviceSlot {
            device_id,
            mode,
            caps,
            sink,
            can_call_this_frame: true,
            vibration: Vibration::Idle,
        });
    }

    pub fn unregister(&mut self, slot: usize) {
        if slot < MAX_HAPTIC_DEVICES {
            self.slots[slot] = None;
        }
    }

    pub fn registered_device(&self, slot: usize) -> Option<u64> {
        self.slots
            .get(slot)
            .and_then(|s| s.as_ref())
            .map(|s| s.device_id)
    }

    pub fn mode(&self, slot: usize) -> Option<HapticMode> {
        self.slots
            .get(slot)
            .and_then(|s| s.as_ref())
            .map(|s| s.mode)
    }

    /// Resets the per-device call budget. Called exactly once per frame,
    /// before the engine update callback runs.
    pub fn begin_frame(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.can_call_this_frame = true;
        }
    }

    /// Engine-facing vibration request. Returns false when the slot is
    /// empty, the frame's call budget is spent, or the hardware call failed.
    pub fn vibrate(&mut self, slot: usize, strength: f32, duration: f32, now: f64) -> bool {
        match self.try_vibrate(slot, strength, duration, now) {
            Ok(()) => true,
            Err(HapticError::BudgetExhausted) => false,
            Err(err) => {
                warn!("Vibration request for slot {} refused: {}", slot, err);
                false
            }
        }
    }

    fn try_vibrate(
        &mut self,
        slot: usize,
        strength: f32,
        duration: f32,
        now: f64,
    ) -> Result<(), HapticError> {
        let device = self
            .slots
            .get_mut(slot)
            .and_then(|s| s.as_mut())
            .ok_or(HapticError::EmptySlot(slot))?;
        if !device.can_call_this_frame {
            return Err(HapticError::BudgetExhausted);
        }

        let strength = strength.clamp(0.0, 1.0);
        match device.mode {
            HapticMode::Simple => {
                if let Err(err) = device.sink.set_amplitude(strength) {
                    warn!("Haptic amplitude call failed: {:?}", err);
                }
                device.can_call_this_frame = false;
                device.vibration = Vibration::Simple {
                    clear_at: now + duration as f64,
                };
            }
            HapticMode::Buffered => {
                let caps = device.caps.ok_or(HapticError::EmptySlot(slot))?;
                // Minimum one sample: a zero-duration request still produces
                // the smallest vibration the hardware can play, and the
                // envelope division below never sees zero.
                // The millisecond product stays in f32 so a decimal duration
                // rounds to its representable value before the ceil.
                let duration_ms = duration * 1000.0;
                let tail_length =
                    ((duration_ms as f64 / caps.sample_duration_ms).ceil() as u32).max(1);
                device.vibration = Vibration::Buffered {
                    tail_length,
                    remaining_length: tail_length,
                    strength,
                    submit_time: now,
                    tail_at: 0,
                };
                Self::step_buffered(device, now);
            }
        }
        Ok(())
    }

    /// Emits at most one pending buffer chunk for the slot. The hardware
    /// queues a single buffer ahead of the one playing, so a new chunk may
    /// only be submitted once the previously queued span has elapsed.
    fn step_buffered(device: &mut DeviceSlot, now: f64) {
        let caps = match device.caps {
            Some(caps) => caps,
            None => return,
        };
        let Vibration::Buffered {
            tail_length,
            remaining_length,
            strength,
            submit_time,
            tail_at,
        } = device.vibration
        else {
            return;
        };
        if remaining_length == 0 || !device.can_call_this_frame || now < submit_time {
            return;
        }

        let chunk_length = (remaining_length as usize).min(caps.samples_max);
        let mut samples = Vec::with_capacity(chunk_length);
        for i in 0..chunk_length as u32 {
            let amplitude =
                (strength - (tail_at + i) as f32 * strength / tail_length as f32).clamp(0.0, 1.0);
            samples.push((amplitude * 255.0).round() as u8);
        }

        let remaining_after = remaining_length - chunk_length as u32;
        let terminated = remaining_after == 0;
        if let Err(err) = device.sink.submit_samples(&samples, terminated) {
            warn!("Haptic buffer submission failed: {:?}", err);
        }
        device.can_call_this_frame = false;

        device.vibration = if terminated {
            Vibration::Idle
        } else {
            Vibration::Buffered {
                tail_length,
                remaining_length: remaining_after,
                strength,
                submit_time: submit_time
                    + chunk_length as f64 * caps.sample_duration_ms / 1000.0,
                tail_at: tail_at + chunk_length as u32,
            }
        };
    }

    /// Per-frame follow-up work: expires simple vibrations and continues
    /// buffered tails, each within the frame's remaining call budget.
    pub fn post_frame(&mut self, now: f64) {
        for device in self.slots.iter_mut().flatten() {
            match device.vibration {
                Vibration::Idle => {}
                Vibration::Simple { clear_at } => {
                    if now >= clear_at && device.can_call_this_frame {
                        if let Err(err) = device.sink.set_amplitude(0.0) {
                            warn!("Haptic stop call failed: {:?}", err);
                        }
                        device.can_call_this_frame = false;
                        device.vibration = Vibration::Idle;
                    }
                }
                Vibration::Buffered { .. } => Self::step_buffered(device, now),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct SinkLog {
        amplitudes: Vec<f32>,
        buffers: Vec<(Vec<u8>, bool)>,
    }

    #[derive(Clone, Default)]
    struct CountingSink {
        log: Arc<Mutex<SinkLog>>,
    }

    impl CountingSink {
        fn calls(&self) -> usize {
            let log = self.log.lock().unwrap();
            log.amplitudes.len() + log.buffers.len()
        }
    }

    impl HapticSink for CountingSink {
        fn set_amplitude(&mut self, amplitude: f32) -> anyhow::Result<()> {
            self.log.lock().unwrap().amplitudes.push(amplitude);
            Ok(())
        }

        fn submit_samples(&mut self, samples: &[u8], terminated: bool) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .buffers
                .push((samples.to_vec(), terminated));
            Ok(())
        }
    }

    fn simple_engine() -> (HapticsEngine, CountingSink) {
        let sink = CountingSink::default();
        let mut engine = HapticsEngine::new();
        engine.register(0, 7, HapticMode::Simple, None, Box::new(sink.clone()));
        (engine, sink)
    }

    fn buffered_engine(samples_max: usize, sample_duration_ms: f64) -> (HapticsEngine, CountingSink) {
        let sink = CountingSink::default();
        let mut engine = HapticsEngine::new();
        engine.register(
            0,
            9,
            HapticMode::Buffered,
            Some(BufferedCaps {
                samples_max,
                sample_duration_ms,
            }),
            Box::new(sink.clone()),
        );
        (engine, sink)
    }

    #[test]
    fn simple_second_call_in_frame_is_refused() {
        let (mut engine, sink) = simple_engine();
        engine.begin_frame();
        assert!(engine.vibrate(0, 0.5, 0.1, 0.0));
        assert!(!engine.vibrate(0, 0.8, 0.1, 0.0));
        assert_eq!(sink.calls(), 1);
    }

    #[test]
    fn buffered_second_call_in_frame_submits_nothing() {
        let (mut engine, sink) = buffered_engine(64, 4.0);
        engine.begin_frame();
        assert!(engine.vibrate(0, 1.0, 0.05, 0.0));
        assert!(!engine.vibrate(0, 1.0, 0.05, 0.0));
        assert_eq!(sink.log.lock().unwrap().buffers.len(), 1);
    }

    #[test]
    fn simple_timeout_clears_on_a_later_frame() {
        let (mut engine, sink) = simple_engine();
        engine.begin_frame();
        assert!(engine.vibrate(0, 1.0, 0.1, 0.0));
        // Same frame: the budget is spent, expiry must wait.
        engine.post_frame(0.5);
        assert_eq!(sink.calls(), 1);

        engine.begin_frame();
        engine.post_frame(0.5);
        let log = sink.log.lock().unwrap();
        assert_eq!(log.amplitudes, vec![1.0, 0.0]);
    }

    #[test]
    fn simple_does_not_clear_before_expiry() {
        let (mut engine, sink) = simple_engine();
        engine.begin_frame();
        assert!(engine.vibrate(0, 1.0, 1.0, 0.0));
        engine.begin_frame();
        engine.post_frame(0.25);
        assert_eq!(sink.calls(), 1);
    }

    #[test]
    fn buffered_envelope_decays_monotonically() {
        let (mut engine, sink) = buffered_engine(1024, 4.0);
        engine.begin_frame();
        assert!(engine.vibrate(0, 1.0, 0.1, 0.0));

        let log = sink.log.lock().unwrap();
        assert_eq!(log.buffers.len(), 1);
        let (samples, terminated) = &log.buffers[0];
        assert!(*terminated);
        // ceil(100ms / 4ms) = 25 samples.
        assert_eq!(samples.len(), 25);
        assert_eq!(samples[0], 255);
        assert!(samples.windows(2).all(|w| w[1] <= w[0]));
        // Linear decay lands one step above silence on the final sample.
        assert!(*samples.last().unwrap() as u32 <= 255 / 25 + 1);
    }

    #[test]
    fn buffered_long_tail_spans_frames() {
        // 10 samples total, 4 per submission: chunks of 4, 4, 2.
        let (mut engine, sink) = buffered_engine(4, 10.0);
        engine.begin_frame();
        assert!(engine.vibrate(0, 1.0, 0.1, 0.0));

        // Next frame arrives before the queued chunk's 40ms span elapsed.
        engine.begin_frame();
        engine.post_frame(0.02);
        assert_eq!(sink.log.lock().unwrap().buffers.len(), 1);

        engine.begin_frame();
        engine.post_frame(0.05);
        engine.begin_frame();
        engine.post_frame(0.09);

        let log = sink.log.lock().unwrap();
        let lengths: Vec<_> = log.buffers.iter().map(|(s, _)| s.len()).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
        assert_eq!(
            log.buffers.iter().map(|(_, t)| *t).collect::<Vec<_>>(),
            vec![false, false, true]
        );
    }

    #[test]
    fn zero_duration_produces_one_sample() {
        let (mut engine, sink) = buffered_engine(64, 4.0);
        engine.begin_frame();
        assert!(engine.vibrate(0, 0.5, 0.0, 0.0));

        let log = sink.log.lock().unwrap();
        assert_eq!(log.buffers.len(), 1);
        let (samples, terminated) = &log.buffers[0];
        assert_eq!(samples.len(), 1);
        assert!(*terminated);
        assert_eq!(samples[0], 128);
    }

    #[test]
    fn reconnect_rebinds_slot_mode() {
        let (mut engine, _sink) = simple_engine();
        assert_eq!(engine.mode(0), Some(HapticMode::Simple));

        let other = CountingSink::default();
        engine.register(
            0,
            11,
            HapticMode::Buffered,
            Some(BufferedCaps {
                samples_max: 16,
                sample_duration_ms: 4.0,
            }),
            Box::new(other),
        );
        assert_eq!(engine.mode(0), Some(HapticMode::Buffered));
        assert_eq!(engine.registered_device(0), Some(11));
    }

    #[test]
    fn empty_slot_refuses() {
        let mut engine = HapticsEngine::new();
        engine.begin_frame();
        assert!(!engine.vibrate(1, 1.0, 0.1, 0.0));
    }
}
