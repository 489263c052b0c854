use openxr as xr;

/// Timing data for one upcoming display refresh.
#[derive(Debug, Clone, Copy)]
pub struct PredictedDisplay {
    pub time: xr::Time,
    pub period: xr::Duration,
    pub should_render: bool,
}

/// Source of predicted display timestamps. The runtime implementation wraps
/// the compositor's frame waiter; tests substitute a scripted one.
pub trait DisplayTimePredictor {
    fn predict(&mut self, frame_index: i64) -> anyhow::Result<PredictedDisplay>;
}

/// Tracks the monotonically increasing frame index and the display timestamp
/// predicted for it. The index is incremented exactly once per loop
/// iteration, always immediately before the display-time query for that
/// index; `begin_frame` is the only place either happens.
pub struct FrameTimeline {
    frame_index: i64,
    display_time: xr::Time,
    swap_interval: u32,
}

impl FrameTimeline {
    /// The index is 0 until the first `begin_frame`, which queries for
    /// frame 1.
    pub fn new(swap_interval: u32) -> Self {
        Self {
            frame_index: 0,
            display_time: xr::Time::from_nanos(0),
            swap_interval,
        }
    }

    pub fn begin_frame(
        &mut self,
        predictor: &mut dyn DisplayTimePredictor,
    ) -> anyhow::Result<PredictedDisplay> {
        self.frame_index += 1;
        let predicted = predictor.predict(self.frame_index)?;
        self.display_time = predicted.time;
        Ok(predicted)
    }

    pub fn frame_index(&self) -> i64 {
        self.frame_index
    }

    pub fn display_time(&self) -> xr::Time {
        self.display_time
    }

    pub fn swap_interval(&self) -> u32 {
        self.swap_interval
    }

    /// Swap interval can change between frames, e.g. on config reload.
    pub fn set_swap_interval(&mut self, swap_interval: u32) {
        self.swap_interval = swap_interval;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct ScriptedPredictor {
        queried_indices: Vec<i64>,
    }

    impl DisplayTimePredictor for ScriptedPredictor {
        fn predict(&mut self, frame_index: i64) -> anyhow::Result<PredictedDisplay> {
            self.queried_indices.push(frame_index);
            Ok(PredictedDisplay {
                // Deterministic 72Hz-ish timestamps derived from the index.
                time: xr::Time::from_nanos(frame_index * 13_888_888),
                period: xr::Duration::from_nanos(13_888_888),
                should_render: true,
            })
        }
    }

    #[test]
    fn frame_index_increments_once_per_iteration() -> anyhow::Result<()> {
        let mut timeline = FrameTimeline::new(1);
        let mut predictor = ScriptedPredictor {
            queried_indices: Vec::new(),
        };

        let first_index = timeline.frame_index();
        for _ in 0..5 {
            timeline.begin_frame(&mut predictor)?;
        }

        assert_eq!(
            predictor.queried_indices,
            (first_index + 1..=first_index + 5).collect::<Vec<_>>()
        );
        assert_eq!(timeline.frame_index(), first_index + 5);
        Ok(())
    }

    #[test]
    fn display_time_is_queried_with_the_incremented_index() -> anyhow::Result<()> {
        let mut timeline = FrameTimeline::new(1);
        let mut predictor = ScriptedPredictor {
            queried_indices: Vec::new(),
        };

        let predicted = timeline.begin_frame(&mut predictor)?;
        // The query must see the post-increment index, never the stale one.
        assert_eq!(predictor.queried_indices, vec![timeline.frame_index()]);
        assert_eq!(timeline.display_time(), predicted.time);
        Ok(())
    }

    #[test]
    fn swap_interval_can_change_between_frames() {
        let mut timeline = FrameTimeline::new(1);
        timeline.set_swap_interval(2);
        assert_eq!(timeline.swap_interval(), 2);
    }
}
