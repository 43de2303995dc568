//! Downstream sinks: the Zabbix trapper sender and the web API client.

pub mod web;
pub mod zabbix;
