utils::configurable_constants! {
    /// The minimum spacing, in milliseconds, between two progress notifications delivered to the
    /// delegate.  Updates arriving in between are coalesced into the next delivery.  0 disables
    /// the throttle.
    ///
    /// Use the environment variable `MEDIA_UPLOAD_PROGRESS_NOTIFICATION_INTERVAL_MS` to set this value.
    ref PROGRESS_NOTIFICATION_INTERVAL_MS: u64 = 0;
}
