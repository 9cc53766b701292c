pub mod cart_item;
pub mod coupon;
pub mod coupon_usage;
pub mod download;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product;
pub mod product_file;
pub mod settlement;
