use proxy_stream::{Lease, PutAction};
use std::{cell::RefCell, rc::Rc, sync::Once};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static START: Once = Once::new();

/// Setup function that is only run once, even if called multiple times.
pub fn setup() {
    START.call_once(|| {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

/// A lease that records every release and keeps the returned socket.
pub struct RecordingLease<S> {
    pub actions: Rc<RefCell<Vec<PutAction>>>,
    pub returned: Rc<RefCell<Option<S>>>,
}

impl<S> RecordingLease<S> {
    #[allow(clippy::type_complexity)]
    pub fn new() -> (Self, Rc<RefCell<Vec<PutAction>>>, Rc<RefCell<Option<S>>>) {
        let actions = Rc::new(RefCell::new(Vec::new()));
        let returned = Rc::new(RefCell::new(None));
        (
            RecordingLease {
                actions: actions.clone(),
                returned: returned.clone(),
            },
            actions,
            returned,
        )
    }
}

impl<S> Lease<S> for RecordingLease<S> {
    fn release(&mut self, resource: S, action: PutAction) {
        self.actions.borrow_mut().push(action);
        *self.returned.borrow_mut() = Some(resource);
    }
}
