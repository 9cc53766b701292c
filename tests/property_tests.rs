//! Property-based checks on the money arithmetic and signing helpers.

use chrono::{Duration, TimeZone, Utc};
use marketplace_ledger::entities::coupon::{self, ApplyTo, CouponStatus, DiscountType};
use marketplace_ledger::entities::order::order_total;
use marketplace_ledger::entities::order_item::LineAmounts;
use marketplace_ledger::entities::settlement::SettlementAmounts;
use marketplace_ledger::services::downloads::{generate_token, UrlSigner};
use marketplace_ledger::services::orders::generate_order_number;
use marketplace_ledger::services::shipping::Carrier;
use marketplace_ledger::services::PageRequest;
use proptest::prelude::*;
use rust_decimal::Decimal;

const SIGNING_SECRET: &str = "0123456789abcdef0123456789abcdef";

fn won() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000).prop_map(Decimal::from)
}

fn cents() -> impl Strategy<Value = Decimal> {
    (0i64..1_000_000_000).prop_map(|c| Decimal::new(c, 2))
}

fn rate() -> impl Strategy<Value = Decimal> {
    (0i64..=1000).prop_map(|bp| Decimal::new(bp, 4))
}

fn coupon_of(discount_type: DiscountType, value: Decimal, cap: Option<Decimal>) -> coupon::Model {
    let now = Utc::now();
    coupon::Model {
        id: 1,
        code: "PROP".into(),
        name: "prop".into(),
        description: None,
        discount_type,
        discount_value: value,
        max_discount: cap,
        min_order_amount: Decimal::ZERO,
        apply_to: ApplyTo::All,
        apply_ids: None,
        usage_limit: None,
        usage_per_user: 1,
        usage_count: 0,
        starts_at: None,
        expires_at: None,
        status: CouponStatus::Active,
        is_public: false,
        created_by: None,
        created_at: now,
        updated_at: now,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn line_amounts_split_the_subtotal_exactly(price in cents(), qty in 1i32..1000, fee in 0i64..=3000) {
        let fee_rate = Decimal::new(fee, 2);
        let amounts = LineAmounts::compute(price, qty, fee_rate);
        prop_assert_eq!(amounts.subtotal, price * Decimal::from(qty));
        prop_assert_eq!(amounts.platform_fee + amounts.seller_amount, amounts.subtotal);
        prop_assert!(amounts.platform_fee >= Decimal::ZERO);
        prop_assert!(amounts.platform_fee.scale() <= 2);
    }

    #[test]
    fn order_total_is_never_negative(subtotal in won(), discount in won(), shipping in won()) {
        let total = order_total(subtotal, discount, shipping);
        prop_assert!(total >= Decimal::ZERO);
        if discount <= subtotal {
            prop_assert_eq!(total, subtotal - discount + shipping);
        }
    }

    #[test]
    fn discounts_stay_within_the_discounted_amount(
        amount in won(),
        value in 1i64..200_000,
        pct in 1i64..=100,
        cap in proptest::option::of(1i64..50_000),
    ) {
        let fixed = coupon_of(DiscountType::Fixed, Decimal::from(value), None);
        let d = fixed.calculate_discount(amount);
        prop_assert!(d >= Decimal::ZERO && d <= amount);

        let cap = cap.map(Decimal::from);
        let percent = coupon_of(DiscountType::Percent, Decimal::from(pct), cap);
        let d = percent.calculate_discount(amount);
        prop_assert!(d >= Decimal::ZERO && d <= amount);
        if let Some(cap) = cap {
            prop_assert!(d <= cap);
        }

        let shipping = coupon_of(DiscountType::FreeShipping, Decimal::ZERO, None);
        prop_assert_eq!(shipping.calculate_discount(amount), Decimal::ZERO);
    }

    #[test]
    fn settlement_amount_balances(sales in cents(), refund_share in 0u8..=100, pg in rate(), platform in rate()) {
        let refunds = (sales * Decimal::from(refund_share) / Decimal::ONE_HUNDRED).round_dp(2);
        let s = SettlementAmounts::compute(sales, refunds, pg, platform);
        prop_assert_eq!(
            s.settlement_amount + s.pg_fees + s.platform_fees,
            s.total_sales - s.total_refunds
        );
        prop_assert!(s.settlement_amount >= Decimal::ZERO);
    }

    #[test]
    fn signed_links_only_verify_for_their_token(
        expires_in in 1i64..86_400,
        other in "[0-9a-f]{64}",
    ) {
        let signer = UrlSigner::new(SIGNING_SECRET).unwrap();
        let now = Utc::now();
        let token = generate_token();
        let exp = (now + Duration::seconds(expires_in)).timestamp();
        let sig = signer.sign(&token, exp);

        prop_assert!(signer.verify(&token, &sig, exp, now));
        prop_assert!(!signer.verify(&token, &sig, exp + 1, now));
        prop_assert!(!signer.verify(&token, &sig, exp, now + Duration::seconds(expires_in)));
        prop_assume!(other != token);
        prop_assert!(!signer.verify(&other, &sig, exp, now));
    }

    #[test]
    fn order_numbers_are_timestamp_prefixed(secs in 0i64..4_000_000_000) {
        let at = Utc.timestamp_opt(secs, 0).unwrap();
        let number = generate_order_number(at);
        prop_assert_eq!(number.len(), 20);
        prop_assert!(number.chars().all(|c| c.is_ascii_digit()));
        let prefix = at.format("%Y%m%d%H%M%S").to_string();
        prop_assert!(number.starts_with(&prefix));
    }

    #[test]
    fn page_requests_are_clamped(page in 0u64..10_000, limit in 0u64..10_000) {
        let p = PageRequest::new(page, limit);
        prop_assert!(p.page >= 1);
        prop_assert!(p.limit >= 1 && p.limit <= 100);
    }

    #[test]
    fn cj_numbers_are_ten_to_twelve_digits(digits in "[0-9]{1,15}") {
        let ok = Carrier::Cj.validate_number(&digits).is_ok();
        prop_assert_eq!(ok, (10..=12).contains(&digits.len()));
    }
}
