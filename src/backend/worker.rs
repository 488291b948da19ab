use futures::StreamExt;
use futures::channel::mpsc;
use futures::executor::block_on;

use super::api::{BackendError, BackendRequest, Notification, RequestId, RestoreInfo, ScenarioApi};

pub type Reply = (RequestId, Result<RestoreInfo, BackendError>);

/// UI-side handle to the scenario worker thread.
///
/// Requests go down an unbounded channel and are executed strictly in order;
/// replies and model notifications come back on their own channels and are
/// drained from the UI loop. Nothing here ever blocks the UI thread.
pub struct BackendHandle {
    request_tx: mpsc::UnboundedSender<(RequestId, BackendRequest)>,
    reply_rx: mpsc::UnboundedReceiver<Reply>,
    notification_rx: mpsc::UnboundedReceiver<Notification>,
    next_request: RequestId,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl BackendHandle {
    pub fn spawn(api: impl ScenarioApi + 'static) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded();
        let (reply_tx, reply_rx) = mpsc::unbounded();
        let (notification_tx, notification_rx) = mpsc::unbounded();

        let worker = std::thread::Builder::new()
            .name("scenario-backend".to_owned())
            .spawn(move || worker_loop(api, request_rx, reply_tx, notification_tx))
            .expect("failed to spawn backend worker thread");

        Self {
            request_tx,
            reply_rx,
            notification_rx,
            next_request: 0,
            worker: Some(worker),
        }
    }

    pub fn submit(&mut self, request: BackendRequest) -> RequestId {
        self.next_request += 1;
        let id = self.next_request;
        log::debug!("backend request {}: {:?}", id, request);
        if self.request_tx.unbounded_send((id, request)).is_err() {
            log::error!("backend worker is gone, request {} dropped", id);
        }
        id
    }

    /// Non-blocking; `None` when no reply is waiting.
    pub fn poll_reply(&mut self) -> Option<Reply> {
        self.reply_rx.try_next().ok().flatten()
    }

    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.notification_rx.try_next().ok().flatten()
    }

    /// Blocks until the next reply arrives. Test/shutdown helper, not for the
    /// interactive path.
    pub fn wait_reply(&mut self) -> Option<Reply> {
        block_on(self.reply_rx.next())
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.request_tx.close_channel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    mut api: impl ScenarioApi,
    mut request_rx: mpsc::UnboundedReceiver<(RequestId, BackendRequest)>,
    reply_tx: mpsc::UnboundedSender<Reply>,
    notification_tx: mpsc::UnboundedSender<Notification>,
) {
    while let Some((id, request)) = block_on(request_rx.next()) {
        let reply = api.execute(request);
        for n in api.drain_notifications() {
            if notification_tx.unbounded_send(n).is_err() {
                return;
            }
        }
        if reply_tx.unbounded_send((id, reply)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::testing::MemoryScenario;
    use eframe::egui;

    #[test]
    fn test_replies_arrive_in_submission_order() {
        let (scenario, root) = MemoryScenario::with_root();
        let mut handle = BackendHandle::spawn(scenario);

        let a = handle.submit(BackendRequest::CreateChildPart {
            parent: root,
            name: "a".to_owned(),
            position: egui::Pos2::ZERO,
        });
        let b = handle.submit(BackendRequest::CreateChildPart {
            parent: root,
            name: "b".to_owned(),
            position: egui::Pos2::new(10.0, 10.0),
        });

        let (first, r1) = handle.wait_reply().unwrap();
        let (second, r2) = handle.wait_reply().unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
        assert!(r1.is_ok() && r2.is_ok());
    }

    #[test]
    fn test_failed_request_reports_error() {
        let (scenario, _root) = MemoryScenario::with_root();
        let mut handle = BackendHandle::spawn(scenario);

        let missing = crate::common::ids::PartId::now_v7();
        handle.submit(BackendRequest::RemoveChildPart { part: missing });
        let (_, reply) = handle.wait_reply().unwrap();
        assert_eq!(reply, Err(BackendError::UnknownPart(missing)));
    }
}
