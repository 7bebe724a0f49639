// gl-test-utils: mock transport and HTTP poster for link tests.
// Each test spins up its own isolated mock glasses instance.

pub mod mock_http;
pub mod mock_transport;

pub use mock_http::MockPoster;
pub use mock_transport::{MockDeviceBehavior, MockTransport};
