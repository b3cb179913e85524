/*!
# Mender DevKit - Test tooling for the mender kernel

Everything needed to drive a real kernel from tests:
- `TestHarness`: kernel on ephemeral ports inside a temp directory
- `WorkerClient`: speaks the identity, heartbeat and log-stream protocols
- `MockFixer`: scripted fixer recording every request
- `HealthSinkStub`: in-process WebSocket sink collecting health reports
*/

pub mod line_builder;
pub mod mock_fixer;
pub mod sink_stub;
pub mod test_utils;
pub mod worker_client;

pub use line_builder::LineBuilder;
pub use mock_fixer::{MockFixer, MockReply};
pub use sink_stub::HealthSinkStub;
pub use test_utils::TestHarness;
pub use worker_client::{LogStream, WorkerClient};
