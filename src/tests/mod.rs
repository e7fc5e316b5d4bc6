mod popen;

use crate::{
    CaptureData, ChildState, Communicator, Exec, ExitStatus, FileDescriptor, NullFile, Popen,
    PopenConfig, PopenError, Redirection,
};

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn public_types_are_send_and_sync() {
    assert_send_sync::<Popen>();
    assert_send_sync::<Communicator>();
    assert_send_sync::<CaptureData>();
    assert_send_sync::<ChildState>();
    assert_send_sync::<ExitStatus>();
    assert_send_sync::<NullFile>();
    assert_send_sync::<Exec>();
    assert_send_sync::<PopenConfig>();
    assert_send_sync::<PopenError>();
    assert_send_sync::<Redirection>();
    assert_send_sync::<FileDescriptor>();
}
