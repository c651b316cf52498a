use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub offers_total: IntCounterVec,
    pub otp_requests_total: IntCounterVec,
    pub otp_verifications_total: IntCounterVec,
    pub open_orders: IntGauge,
    pub events_published_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order status transitions by target and outcome"),
            &["to", "outcome"],
        )
        .expect("valid order_transitions_total metric");

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Courier offers by final outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let otp_requests_total = IntCounterVec::new(
            Opts::new("otp_requests_total", "OTP code requests by outcome"),
            &["outcome"],
        )
        .expect("valid otp_requests_total metric");

        let otp_verifications_total = IntCounterVec::new(
            Opts::new("otp_verifications_total", "OTP verifications by outcome"),
            &["outcome"],
        )
        .expect("valid otp_verifications_total metric");

        let open_orders = IntGauge::new("open_orders", "Orders not yet in a terminal status")
            .expect("valid open_orders metric");

        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Real-time events published by name"),
            &["event"],
        )
        .expect("valid events_published_total metric");

        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(otp_requests_total.clone()))
            .expect("register otp_requests_total");
        registry
            .register(Box::new(otp_verifications_total.clone()))
            .expect("register otp_verifications_total");
        registry
            .register(Box::new(open_orders.clone()))
            .expect("register open_orders");
        registry
            .register(Box::new(events_published_total.clone()))
            .expect("register events_published_total");

        Self {
            registry,
            transitions_total,
            offers_total,
            otp_requests_total,
            otp_verifications_total,
            open_orders,
            events_published_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
