pub mod browser;
pub mod js_state;
pub mod static_page;

pub use browser::BrowserExtractor;
pub use static_page::StaticExtractor;
