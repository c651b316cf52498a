use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use order_dispatch::api::rest::router;
use order_dispatch::config::{Config, DispatchPolicy};
use order_dispatch::engine::{dispatch, lifecycle};
use order_dispatch::error::AppError;
use order_dispatch::models::actor::Actor;
use order_dispatch::state::AppState;
use order_dispatch::store::{OfferStore, OrderStore};

fn test_config() -> Config {
    Config {
        otp_dev_mode: true,
        ..Config::default()
    }
}

fn setup() -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(test_config()));
    (router(state.clone()), state)
}

fn setup_with(config: Config) -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(config));
    (router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn actor_request(method: &str, uri: &str, role: &str, id: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-actor-role", role)
        .header("x-actor-id", id)
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn actor_request_no_body(method: &str, uri: &str, role: &str, id: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-actor-role", role)
        .header("x-actor-id", id)
        .body(Body::empty())
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn create_restaurant(app: &axum::Router) -> String {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/restaurants",
            json!({
                "name": "Chez Fatou",
                "location": { "lat": 5.3364, "lng": -4.0267 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await["id"].as_str().unwrap().to_string()
}

async fn create_courier(app: &axum::Router, name: &str, lat: f64, lng: f64) -> String {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/couriers",
            json!({
                "name": name,
                "phone": "+2250102030405",
                "location": { "lat": lat, "lng": lng },
                "capacity": 3,
                "rating": 4.5
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await["id"].as_str().unwrap().to_string()
}

async fn create_order(app: &axum::Router, restaurant_id: &str, customer_id: &str) -> Value {
    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            "/orders",
            "customer",
            customer_id,
            json!({
                "restaurant_id": restaurant_id,
                "items": [
                    { "name": "Poulet braisé", "quantity": 1, "unit_price": 5000 },
                    { "name": "Attiéké", "quantity": 2, "unit_price": 1000, "options": ["piment"] }
                ],
                "payment_method": "cash",
                "dropoff": { "lat": 5.3599, "lng": -3.9871 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await
}

/// Drives an order from new to ready and returns (order json, pickup code).
async fn order_to_ready(
    app: &axum::Router,
    restaurant_id: &str,
    customer_id: &str,
) -> (Value, String) {
    let order = create_order(app, restaurant_id, customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/accept"),
            "restaurant",
            restaurant_id,
            json!({ "estimated_prep_minutes": 20 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let accepted = body_json(res).await;
    let pickup_code = accepted["pickup_code"].as_str().unwrap().to_string();

    for step in ["preparing", "ready"] {
        let res = app
            .clone()
            .oneshot(actor_request_no_body(
                "POST",
                &format!("/orders/{order_id}/{step}"),
                "restaurant",
                restaurant_id,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK, "step {step}");
    }

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    (body_json(res).await, pickup_code)
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["orders"], 0);
    assert_eq!(body["couriers"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    assert!(body.contains("open_orders"));
}

#[tokio::test]
async fn create_courier_empty_name_returns_400() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/couriers",
            json!({
                "name": "  ",
                "phone": "+2250102030405",
                "location": { "lat": 5.33, "lng": -4.02 },
                "capacity": 3,
                "rating": 4.5
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "validation_error");
}

#[tokio::test]
async fn unknown_actor_role_returns_400() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;

    let response = app
        .oneshot(actor_request(
            "POST",
            "/orders",
            "superuser",
            &Uuid::new_v4().to_string(),
            json!({
                "restaurant_id": restaurant_id,
                "items": [{ "name": "x", "quantity": 1, "unit_price": 100 }],
                "payment_method": "cash",
                "dropoff": { "lat": 5.35, "lng": -4.0 }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_order_starts_new_with_computed_totals() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let order = create_order(&app, &restaurant_id, &Uuid::new_v4().to_string()).await;

    assert_eq!(order["status"], "new");
    assert_eq!(order["subtotal"], 7000);
    // 5% service fee
    assert_eq!(order["service_fee"], 350);
    assert!(order["delivery_fee"].as_u64().unwrap() >= 500);
    assert_eq!(
        order["total"].as_u64().unwrap(),
        7000 + 350 + order["delivery_fee"].as_u64().unwrap()
    );
    assert!(order["courier_id"].is_null());
}

#[tokio::test]
async fn create_order_rejects_totals_that_overflow() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;

    let response = app
        .oneshot(actor_request(
            "POST",
            "/orders",
            "customer",
            &Uuid::new_v4().to_string(),
            json!({
                "restaurant_id": restaurant_id,
                "items": [
                    { "name": "everything", "quantity": 3, "unit_price": u64::MAX / 2 }
                ],
                "payment_method": "cash",
                "dropoff": { "lat": 5.3599, "lng": -3.9871 }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "validation_error");
}

#[tokio::test]
async fn accept_by_wrong_restaurant_is_forbidden() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let order = create_order(&app, &restaurant_id, &Uuid::new_v4().to_string()).await;
    let order_id = order["id"].as_str().unwrap();

    let response = app
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/accept"),
            "restaurant",
            &Uuid::new_v4().to_string(),
            json!({}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "forbidden");
}

#[tokio::test]
async fn skipping_preparing_fails_with_invalid_transition() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let order = create_order(&app, &restaurant_id, &Uuid::new_v4().to_string()).await;
    let order_id = order["id"].as_str().unwrap();

    // ready straight from new
    let response = app
        .oneshot(actor_request_no_body(
            "POST",
            &format!("/orders/{order_id}/ready"),
            "restaurant",
            &restaurant_id,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "invalid_transition");
}

#[tokio::test]
async fn full_delivery_flow_end_to_end() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let courier_a = create_courier(&app, "Awa", 5.3365, -4.0266).await;
    let _courier_b = create_courier(&app, "Bakary", 5.34, -4.03).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, pickup_code) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    assert_eq!(order["status"], "ready");

    // broadcast: both couriers hold a pending offer
    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    let offers = offers.as_array().unwrap();
    assert_eq!(offers.len(), 2);
    assert!(offers.iter().all(|o| o["status"] == "pending"));

    let offer_a = offers
        .iter()
        .find(|o| o["courier_id"] == courier_a.as_str())
        .unwrap();
    let offer_a_id = offer_a["id"].as_str().unwrap();

    // courier A accepts; sibling offer expires
    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/offers/{offer_a_id}/accept"),
            "courier",
            &courier_a,
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "accepted");

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    for offer in offers.as_array().unwrap() {
        if offer["id"] == offer_a_id {
            assert_eq!(offer["status"], "accepted");
        } else {
            assert_eq!(offer["status"], "expired");
        }
    }

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    let order = body_json(res).await;
    assert_eq!(order["courier_id"], courier_a.as_str());
    let delivery_code = order["delivery_code"].as_str().unwrap().to_string();

    // pickup with the restaurant's code, then deliver
    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/pickup"),
            "courier",
            &courier_a,
            json!({ "pickup_code": pickup_code }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(actor_request_no_body(
            "POST",
            &format!("/orders/{order_id}/delivering"),
            "courier",
            &courier_a,
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/delivered"),
            "courier",
            &courier_a,
            json!({ "delivery_code": delivery_code, "proof_url": "https://cdn.example/p.jpg" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let delivered = body_json(res).await;

    assert_eq!(delivered["status"], "delivered");
    assert_eq!(delivered["review_eligible"], true);

    // every intermediate timestamp populated, in order
    let ts = &delivered["timestamps"];
    let stamps: Vec<chrono::DateTime<chrono::Utc>> = [
        "accepted_at",
        "preparing_at",
        "ready_at",
        "picked_up_at",
        "delivering_at",
        "delivered_at",
    ]
    .iter()
    .map(|key| {
        let raw = ts[*key].as_str().unwrap_or_else(|| panic!("{key} missing"));
        raw.parse().unwrap()
    })
    .collect();
    for pair in stamps.windows(2) {
        assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
    }
}

#[tokio::test]
async fn wrong_pickup_code_is_rejected() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let courier = create_courier(&app, "Awa", 5.3365, -4.0266).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, pickup_code) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    let wrong_code = if pickup_code == "0000" { "1111" } else { "0000" };

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    let offer_id = offers.as_array().unwrap()[0]["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/offers/{offer_id}/accept"),
            "courier",
            &courier,
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/pickup"),
            "courier",
            &courier,
            json!({ "pickup_code": wrong_code }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["code"], "validation_error");
}

#[tokio::test]
async fn customer_cannot_cancel_once_ready() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, _) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap();

    let response = app
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            "customer",
            &customer_id,
            json!({ "reason": "changed my mind" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "invalid_transition");
}

#[tokio::test]
async fn customer_can_cancel_while_preparing() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let customer_id = Uuid::new_v4().to_string();

    let order = create_order(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    for (step, body) in [
        ("accept", json!({})),
        ("preparing", json!({})),
    ] {
        let res = app
            .clone()
            .oneshot(actor_request(
                "POST",
                &format!("/orders/{order_id}/{step}"),
                "restaurant",
                &restaurant_id,
                body,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            "customer",
            &customer_id,
            json!({ "reason": "taking too long", "cancellation_type": "customer_request" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["status_reason"], "taking too long");
}

#[tokio::test]
async fn rejection_requires_reason_and_blocks_later_cancel() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let customer_id = Uuid::new_v4().to_string();
    let order = create_order(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    // empty reason refused before any state change
    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/reject"),
            "restaurant",
            &restaurant_id,
            json!({ "reason": "  " }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/reject"),
            "restaurant",
            &restaurant_id,
            json!({ "reason": "out of stock", "rejection_type": "stock" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let rejected = body_json(res).await;
    assert_eq!(rejected["status"], "rejected");
    assert_eq!(rejected["status_reason"], "out of stock");

    // terminal: cancel must now fail
    let res = app
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            "customer",
            &customer_id,
            json!({ "reason": "never mind" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(res).await["code"], "invalid_transition");
}

#[tokio::test]
async fn concurrent_accepts_have_exactly_one_winner() {
    let (app, state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let customer_id = Uuid::new_v4().to_string();
    let order = create_order(&app, &restaurant_id, &customer_id).await;
    let order_id: Uuid = order["id"].as_str().unwrap().parse().unwrap();
    let restaurant: Uuid = restaurant_id.parse().unwrap();

    let state_a = state.clone();
    let state_b = state.clone();
    let a = tokio::spawn(async move {
        lifecycle::accept(&state_a, Actor::Restaurant(restaurant), order_id, None).await
    });
    let b = tokio::spawn(async move {
        lifecycle::accept(&state_b, Actor::Restaurant(restaurant), order_id, None).await
    });

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    let ok_count = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok_count, 1, "exactly one accept must win");

    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(AppError::InvalidTransition(_))));
}

#[tokio::test]
async fn expired_offer_cannot_be_accepted() {
    let config = Config {
        offer_ttl_secs: 0, // offers are born expired
        ..test_config()
    };
    let (app, _state) = setup_with(config);
    let restaurant_id = create_restaurant(&app).await;
    let courier = create_courier(&app, "Awa", 5.3365, -4.0266).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, _) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    let offer_id = offers.as_array().unwrap()[0]["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/offers/{offer_id}/accept"),
            "courier",
            &courier,
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GONE);
    assert_eq!(body_json(res).await["code"], "offer_expired");

    // and the offer now reads as expired
    let res = app
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    assert_eq!(offers.as_array().unwrap()[0]["status"], "expired");
}

#[tokio::test]
async fn losing_accept_race_leaves_no_second_accepted_offer() {
    use order_dispatch::models::offer::OfferStatus;

    let (app, state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let courier_a = create_courier(&app, "Awa", 5.3365, -4.0266).await;
    let courier_b = create_courier(&app, "Bakary", 5.34, -4.03).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, _) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id: Uuid = order["id"].as_str().unwrap().parse().unwrap();

    // Courier A has already won the order while B's offer is still pending:
    // the window where B's accept passes its own offer CAS but loses the
    // assignment CAS.
    let courier_a_id: Uuid = courier_a.parse().unwrap();
    state
        .store
        .cas_assign_courier(order_id, courier_a_id, "4321".to_string(), chrono::Utc::now())
        .await
        .unwrap();

    let courier_b_id: Uuid = courier_b.parse().unwrap();
    let offer_b = state
        .store
        .offers_for_courier(courier_b_id)
        .await
        .into_iter()
        .find(|o| o.order_id == order_id)
        .unwrap();
    assert_eq!(offer_b.status, OfferStatus::Pending);

    let result = dispatch::accept_offer(&state, Actor::Courier(courier_b_id), offer_b.id).await;
    assert!(matches!(result, Err(AppError::OfferExpired)));

    // the loser's offer rolled back; the order holds at most one accepted
    // offer
    let offers = state.store.offers_for_order(order_id).await;
    let accepted: Vec<_> = offers
        .iter()
        .filter(|o| o.status == OfferStatus::Accepted)
        .collect();
    assert!(accepted.is_empty(), "no offer should stay accepted");

    let stored = state.store.load_offer(offer_b.id).await.unwrap();
    assert_eq!(stored.status, OfferStatus::Expired);

    let order = state.store.load_order(order_id).await.unwrap();
    assert_eq!(order.courier_id, Some(courier_a_id));
}

#[tokio::test]
async fn offer_accept_by_wrong_courier_is_forbidden() {
    let (app, _state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let _courier = create_courier(&app, "Awa", 5.3365, -4.0266).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, _) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    let offer_id = offers.as_array().unwrap()[0]["id"].as_str().unwrap().to_string();

    let res = app
        .oneshot(actor_request(
            "POST",
            &format!("/offers/{offer_id}/accept"),
            "courier",
            &Uuid::new_v4().to_string(),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn sequential_policy_advances_on_decline() {
    let config = Config {
        dispatch_policy: DispatchPolicy::Sequential,
        ..test_config()
    };
    let (app, _state) = setup_with(config);
    let restaurant_id = create_restaurant(&app).await;
    // near courier ranks first
    let near = create_courier(&app, "Near", 5.3365, -4.0266).await;
    let far = create_courier(&app, "Far", 5.45, -3.90).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, _) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    // one offer at a time, to the best-ranked courier
    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    let offers = offers.as_array().unwrap().clone();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["courier_id"], near.as_str());
    let first_offer_id = offers[0]["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/offers/{first_offer_id}/decline"),
            "courier",
            &near,
            json!({ "reason": "too far" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "declined");

    // next candidate got the follow-up offer
    let res = app
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    let pending: Vec<&Value> = offers
        .as_array()
        .unwrap()
        .iter()
        .filter(|o| o["status"] == "pending")
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["courier_id"], far.as_str());
}

#[tokio::test]
async fn reject_releases_pending_offers() {
    // offers injected directly: the protocol only creates them at ready,
    // but release-on-reject must hold regardless of how they got there
    use chrono::{Duration, Utc};
    use order_dispatch::models::offer::{Offer, OfferStatus};

    let (app, state) = setup();
    let restaurant_id = create_restaurant(&app).await;
    let customer_id = Uuid::new_v4().to_string();
    let order = create_order(&app, &restaurant_id, &customer_id).await;
    let order_id: Uuid = order["id"].as_str().unwrap().parse().unwrap();

    let now = Utc::now();
    state
        .store
        .insert_offer(Offer {
            id: Uuid::new_v4(),
            order_id,
            courier_id: Uuid::new_v4(),
            status: OfferStatus::Pending,
            decline_reason: None,
            created_at: now,
            expires_at: now + Duration::seconds(120),
            resolved_at: None,
        })
        .await;

    let res = app
        .oneshot(actor_request(
            "POST",
            &format!("/orders/{order_id}/reject"),
            "restaurant",
            &restaurant_id,
            json!({ "reason": "closing early" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let offers = state.store.offers_for_order(order_id).await;
    assert!(offers.iter().all(|o| o.status == OfferStatus::Expired));
}

#[tokio::test]
async fn expire_stale_sweep_flips_overdue_offers() {
    let config = Config {
        offer_ttl_secs: 0,
        ..test_config()
    };
    let (app, state) = setup_with(config);
    let restaurant_id = create_restaurant(&app).await;
    let _courier = create_courier(&app, "Awa", 5.3365, -4.0266).await;
    let customer_id = Uuid::new_v4().to_string();

    let (order, _) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id: Uuid = order["id"].as_str().unwrap().parse().unwrap();

    let flipped = dispatch::expire_stale(&state).await;
    assert_eq!(flipped, 1);

    let offers = state.store.offers_for_order(order_id).await;
    assert!(offers
        .iter()
        .all(|o| o.status == order_dispatch::models::offer::OfferStatus::Expired));
}

#[tokio::test]
async fn otp_request_is_rate_limited() {
    let (app, _state) = setup();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/request",
            json!({ "phone": "+2250700000000" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .oneshot(json_request(
            "POST",
            "/auth/otp/request",
            json!({ "phone": "+2250700000000" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(res).await["code"], "rate_limited");
}

#[tokio::test]
async fn otp_code_verifies_once_and_only_once() {
    let (app, _state) = setup();
    let phone = "+2250700000001";

    let res = app
        .clone()
        .oneshot(json_request("POST", "/auth/otp/request", json!({ "phone": phone })))
        .await
        .unwrap();
    let code = body_json(res).await["dev_code"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({ "phone": phone, "code": code }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome = body_json(res).await;
    assert_eq!(outcome["is_new_account"], true);
    assert!(outcome["token"].as_str().is_some());

    // consumed: second verify finds nothing
    let res = app
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({ "phone": phone, "code": code }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(res).await["code"], "no_active_challenge");
}

#[tokio::test]
async fn otp_attempts_budget_is_enforced() {
    let (app, _state) = setup();
    let phone = "+2250700000002";

    let res = app
        .clone()
        .oneshot(json_request("POST", "/auth/otp/request", json!({ "phone": phone })))
        .await
        .unwrap();
    let code = body_json(res).await["dev_code"].as_str().unwrap().to_string();
    let wrong = if code == "000000" { "111111" } else { "000000" };

    // attempts 1 and 2: invalid_code with remaining counts
    for remaining in [2, 1] {
        let res = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/otp/verify",
                json!({ "phone": phone, "code": wrong }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert_eq!(body["code"], "invalid_code");
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains(&format!("{remaining} attempts remaining")));
    }

    // attempt 3 exhausts the budget
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({ "phone": phone, "code": wrong }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(res).await["code"], "max_attempts_exceeded");

    // the correct code on the 4th attempt still fails
    let res = app
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({ "phone": phone, "code": code }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(res).await["code"], "max_attempts_exceeded");
}

#[tokio::test]
async fn referral_credits_referrer_once() {
    let (app, state) = setup();

    // first customer registers
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/request",
            json!({ "phone": "+2250700000003" }),
        ))
        .await
        .unwrap();
    let code = body_json(res).await["dev_code"].as_str().unwrap().to_string();
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({ "phone": "+2250700000003", "code": code }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let referrer = state
        .accounts
        .get("+2250700000003")
        .map(|e| e.value().clone())
        .unwrap();

    // second customer registers with the referral code
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/request",
            json!({ "phone": "+2250700000004" }),
        ))
        .await
        .unwrap();
    let code = body_json(res).await["dev_code"].as_str().unwrap().to_string();
    let res = app
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({
                "phone": "+2250700000004",
                "code": code,
                "referral_code": referrer.referral_code
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let referred_id: Uuid = body_json(res).await["customer_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let entry = state.referrals.get(&referred_id).unwrap().value().clone();
    assert_eq!(entry.referrer_id, referrer.id);
    assert_eq!(entry.points, 25);

    let updated = state
        .accounts
        .get("+2250700000003")
        .map(|e| e.value().clone())
        .unwrap();
    assert_eq!(updated.loyalty_points, referrer.loyalty_points + 25);
}

#[tokio::test]
async fn logout_revokes_the_session() {
    let (app, _state) = setup();
    let phone = "+2250700000005";

    let res = app
        .clone()
        .oneshot(json_request("POST", "/auth/otp/request", json!({ "phone": phone })))
        .await
        .unwrap();
    let code = body_json(res).await["dev_code"].as_str().unwrap().to_string();
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({ "phone": phone, "code": code }),
        ))
        .await
        .unwrap();
    let token = body_json(res).await["token"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/auth/session/{token}")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(json_request("POST", "/auth/logout", json!({ "token": token })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .oneshot(get_request(&format!("/auth/session/{token}")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn delivery_accrues_loyalty_points() {
    let (app, state) = setup();

    // registered customer so the points have somewhere to land
    let phone = "+2250700000006";
    let res = app
        .clone()
        .oneshot(json_request("POST", "/auth/otp/request", json!({ "phone": phone })))
        .await
        .unwrap();
    let code = body_json(res).await["dev_code"].as_str().unwrap().to_string();
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/otp/verify",
            json!({ "phone": phone, "code": code }),
        ))
        .await
        .unwrap();
    let customer_id = body_json(res).await["customer_id"]
        .as_str()
        .unwrap()
        .to_string();

    let restaurant_id = create_restaurant(&app).await;
    let courier = create_courier(&app, "Awa", 5.3365, -4.0266).await;

    let (order, pickup_code) = order_to_ready(&app, &restaurant_id, &customer_id).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/offers")))
        .await
        .unwrap();
    let offers = body_json(res).await;
    let offer_id = offers.as_array().unwrap()[0]["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(actor_request(
            "POST",
            &format!("/offers/{offer_id}/accept"),
            "courier",
            &courier,
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    let delivery_code = body_json(res).await["delivery_code"]
        .as_str()
        .unwrap()
        .to_string();

    for (step, body) in [
        ("pickup", json!({ "pickup_code": pickup_code })),
        ("delivering", json!({})),
        ("delivered", json!({ "delivery_code": delivery_code })),
    ] {
        let res = app
            .clone()
            .oneshot(actor_request(
                "POST",
                &format!("/orders/{order_id}/{step}"),
                "courier",
                &courier,
                body,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK, "step {step}");
    }

    let account = state.accounts.get(phone).map(|e| e.value().clone()).unwrap();
    assert_eq!(account.loyalty_points, 10);
}
