use anyhow::{Context, Result};
use handlebars::handlebars_helper;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io::{stdout, Write},
    path::Path,
};
use stixcore::config::Config;
use stixcore::io::ProductFactory;
use stixcore::products::{table::Column, Product};
use stixcore::time::TimeService;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ColumnSummary {
    name: String,
    dtype: &'static str,
    width: usize,
    unit: String,
    nix: String,
}

impl From<&Column> for ColumnSummary {
    fn from(col: &Column) -> Self {
        Self {
            name: col.name.clone(),
            dtype: col.values.dtype(),
            width: col.width,
            unit: col.unit.clone().unwrap_or_default(),
            nix: col.meta.nix.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Info {
    filename: String,
    product: String,
    level: String,
    service_type: u8,
    service_subtype: u8,
    ssid: Option<u8>,
    scet_begin: String,
    scet_end: String,
    utc_begin: String,
    utc_end: String,
    control_rows: usize,
    data_rows: usize,
    columns: Vec<ColumnSummary>,
    idb_versions: BTreeMap<String, String>,
    parents: Vec<String>,
    raw_files: Vec<String>,
}

fn summarize(fpath: &Path, product: &Product, time: &dyn TimeService) -> Info {
    let range = product.scet_timerange();
    let (scet_begin, scet_end, utc_begin, utc_end) = if range.is_empty() {
        Default::default()
    } else {
        (
            range.start.to_string(),
            range.end.to_string(),
            time.scet_to_utc(range.start).to_string(),
            time.scet_to_utc(range.end).to_string(),
        )
    };

    Info {
        filename: fpath.to_string_lossy().to_string(),
        product: product.kind.to_string(),
        level: product.level.to_string(),
        service_type: product.service_type,
        service_subtype: product.service_subtype,
        ssid: product.ssid,
        scet_begin,
        scet_end,
        utc_begin,
        utc_end,
        control_rows: product.control.len(),
        data_rows: product.data.len(),
        columns: product.data.columns.iter().map(ColumnSummary::from).collect(),
        idb_versions: product
            .idb_versions
            .iter()
            .map(|(version, range)| (version.clone(), range.to_string()))
            .collect(),
        parents: product.parent(),
        raw_files: product.raw(),
    }
}

pub fn info(fpath: &Path, format: &Format, config: &Config) -> Result<()> {
    let clock = config.clock().context("invalid clock epoch")?;
    let product = ProductFactory::default()
        .load(fpath)
        .with_context(|| format!("loading {fpath:?}"))?;
    let info = summarize(fpath, &product, &clock);

    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &info).context("serializing to json")
        }
        Format::Text => {
            let data = render_text(&info).context("serializing info")?;
            stdout()
                .write_all(str::as_bytes(&data))
                .context("writing to stdout")
        }
    }
}

fn render_text(info: &Info) -> Result<String> {
    handlebars_helper!(left_pad: |num: u64, v: Json| {
        let v = match v {
            serde_json::Value::String(s) => s.to_owned(),
            serde_json::Value::Null => String::new(),
            _ => v.to_string()
        };
        let num = usize::try_from(num).unwrap_or_default().max(v.len());
        format!("{v:>num$}")
    });
    let mut hb = handlebars::Handlebars::new();
    hb.register_helper("lpad", Box::new(left_pad));
    hb.register_template_string("info", TEXT_TEMPLATE)
        .context("compiling template")?;

    hb.render("info", &info).context("rendering text")
}

const TEXT_TEMPLATE: &str = r"{{ filename }}
===============================================================================================
Product:  {{ product }} ({{ level }}, {{ service_type }}/{{ service_subtype }}{{ #if ssid }}/{{ ssid }}{{ /if }})
SCET:     {{ scet_begin }} - {{ scet_end }}
UTC:      {{ utc_begin }} - {{ utc_end }}
Control:  {{ control_rows }} rows
Data:     {{ data_rows }} rows
IDB:      {{ #each idb_versions }}{{ @key }} {{ this }}{{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
Parents:  {{ #each parents }}{{ this }}{{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
Raw:      {{ #each raw_files }}{{ this }}{{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
-----------------------------------------------------------------------------------------------
Column                            Type   Width   Unit       NIX
-----------------------------------------------------------------------------------------------
{{ #each columns }}{{ lpad 30 name }}  {{ lpad 6 dtype }}  {{ lpad 6 width }}   {{ lpad 8 unit }}   {{ nix }}
{{/each }}
";

#[cfg(test)]
mod tests {
    use super::*;
    use stixcore::products::table::Values;
    use stixcore::products::{Control, Data, HkReport, Level, ProductKind};
    use stixcore::time::{LinearClock, ScetDelta, ScetTime};

    fn product() -> Product {
        let mut control = Control {
            scet_coarse: vec![100, 200],
            index: vec![0, 1],
            raw_file: vec!["tm_0001.bin".into(), "tm_0001.bin".into()],
            ..Default::default()
        };
        control.fill_missing();
        let data = Data {
            time: vec![ScetTime::new(100, 0), ScetTime::new(200, 0)],
            timedel: vec![ScetDelta::ZERO; 2],
            control_index: vec![0, 1],
            columns: vec![
                Column::new("hk_temp", Values::F64(vec![40.0, 41.0])).with_unit("degC"),
            ]
            .into(),
        };
        Product::builder()
            .kind(ProductKind::Housekeeping(HkReport::Mini))
            .level(Level::L1)
            .service_type(3)
            .service_subtype(25)
            .ssid(Some(1))
            .control(control)
            .data(data)
            .build()
    }

    #[test]
    fn text_summary() {
        let info = summarize(Path::new("hk.json"), &product(), &LinearClock::default());
        assert_eq!(info.product, "hk-mini");
        assert_eq!(info.scet_begin, "0000000100:00000");

        let text = render_text(&info).unwrap();
        assert!(text.starts_with("hk.json\n"), "{text}");
        assert!(text.contains("Product:  hk-mini (L1, 3/25/1)"), "{text}");
        assert!(text.contains("Raw:      tm_0001.bin"), "{text}");
        assert!(text.contains("hk_temp"), "{text}");
    }
}
