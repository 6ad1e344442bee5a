pub use self::gauge_guard::GaugeGuard;
pub use self::histogram_guard::HistogramGuard;

mod gauge_guard;
mod histogram_guard;
