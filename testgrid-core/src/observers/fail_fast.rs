// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fail-fast trigger observer.

use super::{Observer, ObserverAction};
use crate::message::{Envelope, Message, ShortStatus};

/// On the first `TaskResult(fail)` observed while not in force mode, sets a
/// sticky flag and asks the dispatcher to terminate every worker
/// cooperatively. Once force mode is enabled at construction the trigger
/// never fires -- this is how `--force` disables fail-fast.
pub struct FailFastTrigger {
    force: bool,
    got_fail: bool,
}

impl FailFastTrigger {
    pub fn new(force: bool) -> Self {
        Self {
            force,
            got_fail: false,
        }
    }

    pub fn got_fail(&self) -> bool {
        self.got_fail
    }
}

impl Observer for FailFastTrigger {
    fn on_message(&mut self, envelope: &Envelope) -> ObserverAction {
        if self.force {
            return ObserverAction::None;
        }
        if let Message::TaskResult { short_status, .. } = &envelope.message {
            if *short_status == ShortStatus::Fail {
                self.got_fail = true;
                return ObserverAction::TerminateAll;
            }
        }
        ObserverAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TaskId;

    fn fail_result() -> Envelope {
        Envelope {
            worker_id: 1,
            worker_name: "01_box".to_string(),
            message: Message::TaskResult {
                task_id: TaskId::new("a", ""),
                short_status: ShortStatus::Fail,
            },
        }
    }

    #[test]
    fn fires_on_first_failure_when_not_forced() {
        let mut trigger = FailFastTrigger::new(false);
        assert_eq!(trigger.on_message(&fail_result()), ObserverAction::TerminateAll);
        assert!(trigger.got_fail());
    }

    #[test]
    fn never_fires_in_force_mode() {
        let mut trigger = FailFastTrigger::new(true);
        assert_eq!(trigger.on_message(&fail_result()), ObserverAction::None);
        assert!(!trigger.got_fail());
    }

    #[test]
    fn sticky_flag_stays_set_after_more_passes() {
        let mut trigger = FailFastTrigger::new(false);
        trigger.on_message(&fail_result());
        trigger.on_message(&Envelope {
            worker_id: 2,
            worker_name: "02_box".to_string(),
            message: Message::TaskResult {
                task_id: TaskId::new("b", ""),
                short_status: ShortStatus::Pass,
            },
        });
        assert!(trigger.got_fail());
    }
}
