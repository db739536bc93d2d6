use serde::Serialize;

use crate::config::AccumulatorConfig;

use super::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Triggered,
    Safe,
}

impl Decision {
    /// Triggered drives the line low, Safe drives it high.
    pub fn actuator_level(self) -> bool {
        matches!(self, Decision::Safe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccumulatorState {
    pub score: f64,
    pub frame_counter: u64,
}

/// Rolling confidence score evaluated every `eval_period` frames.
///
/// Each frame adds `base ^ p`, where `p` is the best target-class confidence
/// in that frame (0.0 when absent), so an empty frame still adds 1.0. The
/// score is compared with `threshold` on every evaluation frame and then
/// cleared; the frame counter keeps counting for the whole session.
#[derive(Debug, Clone)]
pub struct DetectionAccumulator {
    config: AccumulatorConfig,
    state: AccumulatorState,
}

impl DetectionAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            state: AccumulatorState {
                score: 0.0,
                frame_counter: 0,
            },
        }
    }

    pub fn reset(&mut self) {
        self.state = AccumulatorState {
            score: 0.0,
            frame_counter: 0,
        };
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn frame_score(&self, detections: &[Detection]) -> f64 {
        detections
            .iter()
            .filter(|d| d.class_id == self.config.target_class)
            .map(|d| f64::from(d.confidence))
            .fold(0.0, f64::max)
    }

    pub fn update(&mut self, detections: &[Detection]) -> Option<Decision> {
        let frame_score = self.frame_score(detections);
        self.state.score += self.config.base.powf(frame_score);
        self.state.frame_counter += 1;

        if self.state.frame_counter % self.config.eval_period != 0 {
            return None;
        }

        let decision = if self.state.score > self.config.threshold {
            Decision::Triggered
        } else {
            Decision::Safe
        };

        tracing::debug!(
            score = format!("{:.2}", self.state.score),
            threshold = self.config.threshold,
            frame = self.state.frame_counter,
            decision = ?decision,
            "accumulator evaluated"
        );

        self.state.score = 0.0;
        Some(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator() -> DetectionAccumulator {
        DetectionAccumulator::new(AccumulatorConfig::default())
    }

    fn target(confidence: f32) -> Detection {
        Detection {
            class_id: 0,
            confidence,
        }
    }

    fn run(acc: &mut DetectionAccumulator, frames: &[Vec<Detection>]) -> Vec<Option<Decision>> {
        frames.iter().map(|f| acc.update(f)).collect()
    }

    #[test]
    fn empty_frame_adds_one() {
        let mut acc = accumulator();
        assert_eq!(acc.update(&[]), None);
        assert_eq!(acc.state().score, 1.0);

        acc.update(&[Detection {
            class_id: 3,
            confidence: 0.99,
        }]);
        assert_eq!(acc.state().score, 2.0);
    }

    #[test]
    fn best_target_confidence_counts() {
        let acc = accumulator();
        let detections = [
            target(0.4),
            Detection {
                class_id: 1,
                confidence: 0.95,
            },
            target(0.5),
        ];
        assert_eq!(acc.frame_score(&detections), f64::from(0.5f32));
        assert_eq!(acc.frame_score(&[]), 0.0);
    }

    #[test]
    fn fifty_empty_frames_are_safe() {
        let mut acc = accumulator();
        for _ in 0..49 {
            assert_eq!(acc.update(&[]), None);
        }
        assert_eq!(acc.state().score, 49.0);
        assert_eq!(acc.update(&[]), Some(Decision::Safe));
    }

    #[test]
    fn high_confidence_triggers() {
        let mut acc = accumulator();
        let decisions = run(&mut acc, &vec![vec![target(0.9)]; 50]);
        assert_eq!(decisions[49], Some(Decision::Triggered));
        assert!(decisions[..49].iter().all(Option::is_none));
    }

    #[test]
    fn threshold_boundary() {
        let mut acc = accumulator();
        let decisions = run(&mut acc, &vec![vec![target(0.70)]; 50]);
        assert_eq!(decisions[49], Some(Decision::Triggered));

        let mut acc = accumulator();
        let decisions = run(&mut acc, &vec![vec![target(0.68)]; 50]);
        assert_eq!(decisions[49], Some(Decision::Safe));
    }

    #[test]
    fn score_resets_after_every_evaluation() {
        let mut acc = accumulator();
        for frames in [vec![vec![target(0.9)]; 50], vec![vec![]; 50]] {
            for detections in &frames {
                acc.update(detections);
            }
            assert_eq!(acc.state().score, 0.0);
        }
        assert_eq!(acc.state().frame_counter, 100);
    }

    #[test]
    fn replay_is_deterministic() {
        let frames: Vec<Vec<Detection>> = (0..250)
            .map(|i| match i % 7 {
                0 => vec![],
                1 | 2 => vec![target(0.95)],
                3 => vec![target(0.2), target(0.81)],
                _ => vec![Detection {
                    class_id: 2,
                    confidence: 0.9,
                }],
            })
            .collect();

        let first = run(&mut accumulator(), &frames);
        let second = run(&mut accumulator(), &frames);
        assert_eq!(first, second);
        assert_eq!(first.iter().filter(|d| d.is_some()).count(), 5);
    }

    #[test]
    fn reset_clears_counter() {
        let mut acc = accumulator();
        for _ in 0..30 {
            acc.update(&[]);
        }
        acc.reset();
        assert_eq!(
            acc.state(),
            AccumulatorState {
                score: 0.0,
                frame_counter: 0
            }
        );
        for _ in 0..49 {
            assert_eq!(acc.update(&[]), None);
        }
        assert_eq!(acc.update(&[]), Some(Decision::Safe));
    }

    #[test]
    fn decision_levels() {
        assert!(!Decision::Triggered.actuator_level());
        assert!(Decision::Safe.actuator_level());
    }
}
