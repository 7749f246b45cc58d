use crate::types::Channel;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_channel(name: &'static str, channel: Channel) {
    ::metrics::increment_counter!(name, "channel" => channel.as_str());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_channel(_name: &'static str, _channel: Channel) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_add(name: &'static str, value: u64) {
    ::metrics::counter!(name, value);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_add(_name: &'static str, _value: u64) {}
