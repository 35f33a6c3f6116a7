//! Stub config and a lockstep rollback engine for driving sessions in tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::derive_partial_eq_without_eq,
    dead_code
)]

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rollback_netplay::{
    Config, ConnectionStatus, Frame, GameInput, InputStatus, InputVec, NetplayError,
    RollbackEngine,
};

#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StubInput {
    pub inp: u32,
}

#[derive(Debug)]
pub struct StubConfig;

impl Config for StubConfig {
    type Input = StubInput;
    type Address = SocketAddr;
}

/// Frames the engine may run ahead of the last confirmed frame.
pub const MAX_PREDICTION: i32 = 8;

#[derive(Debug, Default)]
pub struct EngineState {
    pub frame: i32,
    pub last_confirmed: i32,
    /// Confirmed input per queue, keyed by frame.
    pub inputs: Vec<BTreeMap<i32, StubInput>>,
    /// Inputs handed out as predictions, per queue and frame.
    pub predictions: Vec<BTreeMap<i32, StubInput>>,
    pub frame_delay: Vec<usize>,
    /// Every frame the session asked the engine to roll back to.
    pub rollbacks: Vec<i32>,
    first_incorrect: Option<i32>,
}

/// Read access to the state of an engine owned by a session.
#[derive(Clone)]
pub struct EngineProbe(Arc<Mutex<EngineState>>);

impl EngineProbe {
    pub fn frame(&self) -> i32 {
        self.0.lock().frame
    }

    pub fn last_confirmed(&self) -> i32 {
        self.0.lock().last_confirmed
    }

    pub fn confirmed_input(&self, queue: usize, frame: i32) -> Option<StubInput> {
        self.0.lock().inputs[queue].get(&frame).copied()
    }

    pub fn confirmed_frames(&self, queue: usize) -> Vec<i32> {
        self.0.lock().inputs[queue].keys().copied().collect()
    }

    pub fn rollbacks(&self) -> Vec<i32> {
        self.0.lock().rollbacks.clone()
    }
}

/// Keeps every input it is given and predicts by repeating the last
/// confirmed input. Rollbacks are recorded rather than resimulated.
pub struct LockstepEngine(Arc<Mutex<EngineState>>);

impl LockstepEngine {
    pub fn new(num_players: usize) -> (Self, EngineProbe) {
        let state = Arc::new(Mutex::new(EngineState {
            last_confirmed: -1,
            inputs: vec![BTreeMap::new(); num_players],
            predictions: vec![BTreeMap::new(); num_players],
            frame_delay: vec![0; num_players],
            ..EngineState::default()
        }));
        (Self(Arc::clone(&state)), EngineProbe(state))
    }
}

impl RollbackEngine<StubConfig> for LockstepEngine {
    fn current_frame(&self) -> Frame {
        Frame::new(self.0.lock().frame)
    }

    fn in_rollback(&self) -> bool {
        false
    }

    fn add_local_input(&mut self, queue: usize, input: StubInput) -> Result<Frame, NetplayError> {
        let mut state = self.0.lock();
        if state.frame >= state.last_confirmed + 1 + MAX_PREDICTION {
            return Err(NetplayError::PredictionThreshold);
        }
        let target = state.frame + state.frame_delay[queue] as i32;
        let inputs = &mut state.inputs[queue];
        if inputs.contains_key(&target) {
            // the delay shrank and this frame already has input
            return Ok(Frame::NULL);
        }
        inputs.insert(target, input);
        Ok(Frame::new(target))
    }

    fn add_remote_input(&mut self, queue: usize, input: GameInput<StubInput>) {
        let mut state = self.0.lock();
        let frame = input.frame.as_i32();
        let value = input.inputs.first().copied().unwrap_or_default();
        if let Some(predicted) = state.predictions[queue].remove(&frame) {
            if predicted != value {
                let first = state.first_incorrect.map_or(frame, |f| f.min(frame));
                state.first_incorrect = Some(first);
            }
        }
        state.inputs[queue].insert(frame, value);
    }

    fn synchronize_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Vec<(StubInput, InputStatus)> {
        let mut state = self.0.lock();
        let frame = state.frame;
        let mut synced = Vec::with_capacity(connect_status.len());
        for (queue, status) in connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < Frame::new(frame) {
                synced.push((StubInput::default(), InputStatus::Disconnected));
            } else if let Some(input) = state.inputs[queue].get(&frame) {
                synced.push((*input, InputStatus::Confirmed));
            } else {
                let guess = state.inputs[queue]
                    .values()
                    .next_back()
                    .copied()
                    .unwrap_or_default();
                state.predictions[queue].insert(frame, guess);
                synced.push((guess, InputStatus::Predicted));
            }
        }
        synced
    }

    fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<InputVec<StubInput>, NetplayError> {
        let state = self.0.lock();
        connect_status
            .iter()
            .enumerate()
            .map(|(queue, status)| {
                if status.disconnected && status.last_frame < frame {
                    return Ok(StubInput::default());
                }
                state.inputs[queue]
                    .get(&frame.as_i32())
                    .copied()
                    .ok_or_else(|| NetplayError::GeneralFailure {
                        context: format!("no input for player queue {queue} at frame {frame}"),
                    })
            })
            .collect()
    }

    fn increment_frame(&mut self) {
        self.0.lock().frame += 1;
    }

    fn adjust_simulation(&mut self, seek_to: Frame) {
        let mut state = self.0.lock();
        state.rollbacks.push(seek_to.as_i32());
        state.first_incorrect = None;
    }

    fn check_simulation(&mut self) {
        let first_incorrect = self.0.lock().first_incorrect;
        if let Some(frame) = first_incorrect {
            self.adjust_simulation(Frame::new(frame));
        }
    }

    fn set_last_confirmed_frame(&mut self, frame: Frame) {
        self.0.lock().last_confirmed = frame.as_i32();
    }

    fn set_frame_delay(&mut self, queue: usize, delay: usize) {
        self.0.lock().frame_delay[queue] = delay;
    }
}
