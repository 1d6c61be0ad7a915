//! Scripted doubles for engine tests.
use super::retry::Sleeper;
use crate::gateway::{Completion, CompletionGateway, CompletionRequest};
use crate::sheet::{Sheet, SheetStore};
use anyhow::{anyhow, Result};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Answers requests from a queue; an empty queue fails the call.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: RefCell<VecDeque<Result<Completion>>>,
    requests: RefCell<Vec<CompletionRequest>>,
}

impl ScriptedGateway {
    pub fn new(responses: Vec<Result<Completion>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn text(answers: &[&str]) -> Self {
        Self::new(
            answers
                .iter()
                .map(|answer| Ok(Completion::Text(answer.to_string())))
                .collect(),
        )
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl CompletionGateway for ScriptedGateway {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted response left")))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Holds a sheet in memory and counts saves.
pub struct MemoryStore {
    sheet: Sheet,
    saved: RefCell<Option<Sheet>>,
    saves: Cell<u32>,
    fail_save: bool,
}

impl MemoryStore {
    pub fn new(sheet: Sheet) -> Self {
        Self {
            sheet,
            saved: RefCell::new(None),
            saves: Cell::new(0),
            fail_save: false,
        }
    }

    pub fn failing(sheet: Sheet) -> Self {
        Self {
            fail_save: true,
            ..Self::new(sheet)
        }
    }

    pub fn saves(&self) -> u32 {
        self.saves.get()
    }

    pub fn saved(&self) -> Option<Sheet> {
        self.saved.borrow().clone()
    }
}

impl SheetStore for MemoryStore {
    fn load(&self) -> Result<Sheet> {
        Ok(self.sheet.clone())
    }

    fn save(&self, sheet: &Sheet) -> Result<()> {
        self.saves.set(self.saves.get() + 1);
        if self.fail_save {
            return Err(anyhow!("disk full"));
        }
        *self.saved.borrow_mut() = Some(sheet.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
