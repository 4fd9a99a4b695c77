//! Per-state exit criteria
//!
//! Each waiting state has one variant carrying exactly the flags that can
//! unblock it. The worker installs a fresh variant on every transition;
//! the dispatcher and error path flip flags under the sync lock and wake
//! the worker, which re-checks `is_fulfilled` after every wakeup.

use super::LinkState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExitCriteria {
    Start {
        opened: bool,
        io_error: bool,
        close: bool,
    },
    Reset {
        reset_sent: bool,
        io_error: bool,
        close: bool,
    },
    Uninitialized {
        sync_sent: bool,
        sync_rsp_received: bool,
        io_error: bool,
        close: bool,
    },
    Initialized {
        config_sent: bool,
        config_rsp_received: bool,
        config_received: bool,
        config_rsp_sent: bool,
        io_error: bool,
        close: bool,
    },
    Active {
        sync_received: bool,
        sync_error: bool,
        io_error: bool,
        close: bool,
    },
    /// FAILED and not-yet-open have nothing to wait for
    Inert,
}

impl ExitCriteria {
    pub(crate) fn for_state(state: LinkState) -> Self {
        match state {
            LinkState::Start => ExitCriteria::Start {
                opened: false,
                io_error: false,
                close: false,
            },
            LinkState::Reset => ExitCriteria::Reset {
                reset_sent: false,
                io_error: false,
                close: false,
            },
            LinkState::Uninitialized => ExitCriteria::Uninitialized {
                sync_sent: false,
                sync_rsp_received: false,
                io_error: false,
                close: false,
            },
            LinkState::Initialized => ExitCriteria::Initialized {
                config_sent: false,
                config_rsp_received: false,
                config_received: false,
                config_rsp_sent: false,
                io_error: false,
                close: false,
            },
            LinkState::Active => ExitCriteria::Active {
                sync_received: false,
                sync_error: false,
                io_error: false,
                close: false,
            },
            LinkState::Failed | LinkState::Unknown => ExitCriteria::Inert,
        }
    }

    /// Whether the owning state's wait loop may stop
    pub(crate) fn is_fulfilled(&self) -> bool {
        match *self {
            ExitCriteria::Start {
                opened, io_error, ..
            } => opened || io_error,
            ExitCriteria::Reset {
                reset_sent,
                io_error,
                close,
            } => reset_sent || io_error || close,
            ExitCriteria::Uninitialized {
                sync_sent,
                sync_rsp_received,
                io_error,
                close,
            } => (sync_sent && sync_rsp_received) || io_error || close,
            ExitCriteria::Initialized {
                config_sent,
                config_rsp_received,
                config_received,
                config_rsp_sent,
                io_error,
                close,
            } => {
                (config_sent && config_rsp_received && config_received && config_rsp_sent)
                    || io_error
                    || close
            }
            ExitCriteria::Active {
                sync_received,
                sync_error,
                io_error,
                close,
            } => sync_received || sync_error || io_error || close,
            ExitCriteria::Inert => false,
        }
    }

    pub(crate) fn io_error(&self) -> bool {
        match *self {
            ExitCriteria::Start { io_error, .. }
            | ExitCriteria::Reset { io_error, .. }
            | ExitCriteria::Uninitialized { io_error, .. }
            | ExitCriteria::Initialized { io_error, .. }
            | ExitCriteria::Active { io_error, .. } => io_error,
            ExitCriteria::Inert => false,
        }
    }

    pub(crate) fn close_requested(&self) -> bool {
        match *self {
            ExitCriteria::Start { close, .. }
            | ExitCriteria::Reset { close, .. }
            | ExitCriteria::Uninitialized { close, .. }
            | ExitCriteria::Initialized { close, .. }
            | ExitCriteria::Active { close, .. } => close,
            ExitCriteria::Inert => false,
        }
    }

    pub(crate) fn note_io_error(&mut self) {
        match self {
            ExitCriteria::Start { io_error, .. }
            | ExitCriteria::Reset { io_error, .. }
            | ExitCriteria::Uninitialized { io_error, .. }
            | ExitCriteria::Initialized { io_error, .. }
            | ExitCriteria::Active { io_error, .. } => *io_error = true,
            ExitCriteria::Inert => {}
        }
    }

    pub(crate) fn note_close(&mut self) {
        match self {
            ExitCriteria::Start { close, .. }
            | ExitCriteria::Reset { close, .. }
            | ExitCriteria::Uninitialized { close, .. }
            | ExitCriteria::Initialized { close, .. }
            | ExitCriteria::Active { close, .. } => *close = true,
            ExitCriteria::Inert => {}
        }
    }

    pub(crate) fn note_opened(&mut self) {
        if let ExitCriteria::Start { opened, .. } = self {
            *opened = true;
        }
    }

    pub(crate) fn note_reset_sent(&mut self) {
        if let ExitCriteria::Reset { reset_sent, .. } = self {
            *reset_sent = true;
        }
    }

    pub(crate) fn note_sync_sent(&mut self) {
        if let ExitCriteria::Uninitialized { sync_sent, .. } = self {
            *sync_sent = true;
        }
    }

    pub(crate) fn note_sync_rsp_received(&mut self) {
        if let ExitCriteria::Uninitialized {
            sync_rsp_received, ..
        } = self
        {
            *sync_rsp_received = true;
        }
    }

    pub(crate) fn note_config_sent(&mut self) {
        if let ExitCriteria::Initialized { config_sent, .. } = self {
            *config_sent = true;
        }
    }

    pub(crate) fn note_config_rsp_received(&mut self) {
        if let ExitCriteria::Initialized {
            config_rsp_received,
            ..
        } = self
        {
            *config_rsp_received = true;
        }
    }

    pub(crate) fn note_config_received(&mut self) {
        if let ExitCriteria::Initialized {
            config_received, ..
        } = self
        {
            *config_received = true;
        }
    }

    pub(crate) fn note_config_rsp_sent(&mut self) {
        if let ExitCriteria::Initialized {
            config_rsp_sent, ..
        } = self
        {
            *config_rsp_sent = true;
        }
    }

    pub(crate) fn note_sync_received(&mut self) {
        if let ExitCriteria::Active { sync_received, .. } = self {
            *sync_received = true;
        }
    }

    pub(crate) fn note_sync_error(&mut self) {
        if let ExitCriteria::Active { sync_error, .. } = self {
            *sync_error = true;
        }
    }
}
