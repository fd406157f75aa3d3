use ionbridge_monitor::netdetect::{
    host_address, ipv4_to_default_cidr, parse_prefix, subnet_prefix,
};
use std::net::Ipv4Addr;

#[test]
fn default_cidr_is_24() {
    let cidr = ipv4_to_default_cidr(Ipv4Addr::new(192, 168, 42, 99));
    assert_eq!(cidr.to_string(), "192.168.42.0/24");
}

#[test]
fn prefix_round_trips_through_parse() {
    let prefix = subnet_prefix(Ipv4Addr::new(10, 20, 30, 40));
    assert_eq!(prefix, "10.20.30.");
    let net = parse_prefix(&prefix).expect("valid prefix");
    assert_eq!(net.to_string(), "10.20.30.0/24");
}

#[test]
fn host_address_appends_last_octet() {
    assert_eq!(host_address("10.0.0.", 5), "10.0.0.5");
    assert_eq!(host_address("10.0.0.", 254), "10.0.0.254");
}
